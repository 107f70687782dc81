use std::fmt;

// =============================================================================
// Pixel Buffers
// =============================================================================

/// A single image in row-major HWC layout, one byte per channel.
///
/// Every observation flowing through the preprocessing stages is a `Frame`,
/// including stacked observations (a stack of `k` grayscale frames is just a
/// `Frame` with `k` channels).
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn new(
        height: usize,
        width: usize,
        channels: usize,
        data: Vec<u8>,
    ) -> Result<Self, PreprocessingError> {
        let expected = height * width * channels;
        if data.len() != expected {
            return Err(PreprocessingError::BufferSize {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            height,
            width,
            channels,
            data,
        })
    }

    pub fn zeros(height: usize, width: usize, channels: usize) -> Self {
        Self {
            height,
            width,
            channels,
            data: vec![0; height * width * channels],
        }
    }

    /// Builds an RGB frame from an RGBA scanout buffer, dropping alpha.
    pub fn from_rgba(height: usize, width: usize, rgba: &[u8]) -> Result<Self, PreprocessingError> {
        let expected = height * width * 4;
        if rgba.len() != expected {
            return Err(PreprocessingError::BufferSize {
                expected,
                actual: rgba.len(),
            });
        }
        let mut data = Vec::with_capacity(height * width * 3);
        for px in rgba.chunks_exact(4) {
            data.extend_from_slice(&px[..3]);
        }
        Ok(Self {
            height,
            width,
            channels: 3,
            data,
        })
    }

    pub fn shape(&self) -> (usize, usize, usize) {
        (self.height, self.width, self.channels)
    }

    /// ITU-R 601 luma conversion, rounded to the nearest byte.
    pub fn grayscale(&self) -> Result<Frame, PreprocessingError> {
        if self.channels != 3 {
            return Err(PreprocessingError::UnsupportedChannels {
                channels: self.channels,
            });
        }
        let mut data = Vec::with_capacity(self.height * self.width);
        for px in self.data.chunks_exact(3) {
            let luma =
                0.299 * f64::from(px[0]) + 0.587 * f64::from(px[1]) + 0.114 * f64::from(px[2]);
            data.push(luma.round().min(255.0) as u8);
        }
        Ok(Frame {
            height: self.height,
            width: self.width,
            channels: 1,
            data,
        })
    }

    /// Area-average downscale: each output pixel is the mean of the input
    /// region it covers, with fractional boxes weighted by overlap.
    pub fn resize_area(&self, out_height: usize, out_width: usize) -> Frame {
        let scale_y = self.height as f64 / out_height as f64;
        let scale_x = self.width as f64 / out_width as f64;
        let area = scale_y * scale_x;
        let mut data = Vec::with_capacity(out_height * out_width * self.channels);
        let mut acc = vec![0.0f64; self.channels];
        for oy in 0..out_height {
            let y0 = oy as f64 * scale_y;
            let y1 = y0 + scale_y;
            for ox in 0..out_width {
                let x0 = ox as f64 * scale_x;
                let x1 = x0 + scale_x;
                acc.fill(0.0);
                let mut iy = y0 as usize;
                while (iy as f64) < y1 && iy < self.height {
                    let wy = y1.min((iy + 1) as f64) - y0.max(iy as f64);
                    let mut ix = x0 as usize;
                    while (ix as f64) < x1 && ix < self.width {
                        let wx = x1.min((ix + 1) as f64) - x0.max(ix as f64);
                        let base = (iy * self.width + ix) * self.channels;
                        for (ch, slot) in acc.iter_mut().enumerate() {
                            *slot += wy * wx * f64::from(self.data[base + ch]);
                        }
                        ix += 1;
                    }
                    iy += 1;
                }
                for &sum in &acc {
                    data.push((sum / area).round().clamp(0.0, 255.0) as u8);
                }
            }
        }
        Frame {
            height: out_height,
            width: out_width,
            channels: self.channels,
            data,
        }
    }

    /// Pixel-wise maximum over a set of equally shaped frames.
    pub fn pixelwise_max(frames: &[Frame]) -> Result<Frame, PreprocessingError> {
        let first = frames.first().ok_or(PreprocessingError::EmptyStack)?;
        let mut data = first.data.clone();
        for frame in &frames[1..] {
            if frame.shape() != first.shape() {
                return Err(PreprocessingError::ShapeMismatch {
                    expected: first.shape(),
                    actual: frame.shape(),
                });
            }
            for (slot, &px) in data.iter_mut().zip(&frame.data) {
                *slot = (*slot).max(px);
            }
        }
        Ok(Frame {
            height: first.height,
            width: first.width,
            channels: first.channels,
            data,
        })
    }

    /// Concatenates frames along the channel axis, pixel by pixel. All inputs
    /// must share height and width; channel counts may differ.
    pub fn concat_channels(frames: &[&Frame]) -> Result<Frame, PreprocessingError> {
        let first = *frames.first().ok_or(PreprocessingError::EmptyStack)?;
        let mut channels = 0;
        for frame in frames {
            if frame.height != first.height || frame.width != first.width {
                return Err(PreprocessingError::ShapeMismatch {
                    expected: first.shape(),
                    actual: frame.shape(),
                });
            }
            channels += frame.channels;
        }
        let mut data = Vec::with_capacity(first.height * first.width * channels);
        for y in 0..first.height {
            for x in 0..first.width {
                for frame in frames {
                    let base = (y * frame.width + x) * frame.channels;
                    data.extend_from_slice(&frame.data[base..base + frame.channels]);
                }
            }
        }
        Ok(Frame {
            height: first.height,
            width: first.width,
            channels,
            data,
        })
    }
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PreprocessingError {
    /// A pixel buffer's length disagrees with its declared shape.
    BufferSize { expected: usize, actual: usize },
    /// Two frames that must share a shape do not.
    ShapeMismatch {
        expected: (usize, usize, usize),
        actual: (usize, usize, usize),
    },
    /// An operation that needs RGB input got something else.
    UnsupportedChannels { channels: usize },
    /// A combining operation received no frames.
    EmptyStack,
    /// A frame stack was consumed while holding the wrong number of frames.
    StackSize { expected: usize, actual: usize },
}

impl fmt::Display for PreprocessingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BufferSize { expected, actual } => {
                write!(f, "pixel buffer holds {} bytes, expected {}", actual, expected)
            }
            Self::ShapeMismatch { expected, actual } => {
                write!(f, "frame shape {:?} does not match {:?}", actual, expected)
            }
            Self::UnsupportedChannels { channels } => {
                write!(f, "expected a 3-channel frame, got {} channels", channels)
            }
            Self::EmptyStack => write!(f, "no frames to combine"),
            Self::StackSize { expected, actual } => {
                write!(f, "frame stack holds {} frames, expected {}", actual, expected)
            }
        }
    }
}

impl std::error::Error for PreprocessingError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_validates_buffer_len() {
        let err = Frame::new(2, 2, 1, vec![0; 3]).unwrap_err();
        assert_eq!(
            err,
            PreprocessingError::BufferSize {
                expected: 4,
                actual: 3
            }
        );
    }

    #[test]
    fn from_rgba_drops_alpha() {
        let rgba = vec![1, 2, 3, 255, 4, 5, 6, 255];
        let frame = Frame::from_rgba(1, 2, &rgba).unwrap();
        assert_eq!(frame.shape(), (1, 2, 3));
        assert_eq!(frame.data, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn from_rgba_rejects_short_buffer() {
        let err = Frame::from_rgba(2, 2, &[0; 15]).unwrap_err();
        assert_eq!(
            err,
            PreprocessingError::BufferSize {
                expected: 16,
                actual: 15
            }
        );
    }

    #[test]
    fn grayscale_uses_luma_weights() {
        let frame = Frame::new(1, 3, 3, vec![255, 0, 0, 0, 255, 0, 0, 0, 255]).unwrap();
        let gray = frame.grayscale().unwrap();
        assert_eq!(gray.shape(), (1, 3, 1));
        assert_eq!(gray.data, vec![76, 150, 29]);
    }

    #[test]
    fn grayscale_rejects_non_rgb() {
        let err = Frame::zeros(2, 2, 1).grayscale().unwrap_err();
        assert_eq!(err, PreprocessingError::UnsupportedChannels { channels: 1 });
    }

    #[test]
    fn area_resize_averages_aligned_blocks() {
        #[rustfmt::skip]
        let data = vec![
            10, 10, 20, 20,
            10, 10, 20, 20,
            30, 30, 40, 40,
            30, 30, 40, 40,
        ];
        let frame = Frame::new(4, 4, 1, data).unwrap();
        let small = frame.resize_area(2, 2);
        assert_eq!(small.shape(), (2, 2, 1));
        assert_eq!(small.data, vec![10, 20, 30, 40]);
    }

    #[test]
    fn area_resize_weights_fractional_boxes() {
        let frame = Frame::new(1, 3, 1, vec![0, 90, 255]).unwrap();
        let small = frame.resize_area(1, 2);
        // Boxes cover [0, 1.5) and [1.5, 3): (0 + 45) / 1.5 and (45 + 255) / 1.5.
        assert_eq!(small.data, vec![30, 200]);
    }

    #[test]
    fn area_resize_preserves_channels() {
        let frame = Frame::new(2, 2, 2, vec![10, 0, 20, 0, 30, 0, 40, 100]).unwrap();
        let small = frame.resize_area(1, 1);
        assert_eq!(small.shape(), (1, 1, 2));
        assert_eq!(small.data, vec![25, 25]);
    }

    #[test]
    fn pixelwise_max_keeps_brightest() {
        let a = Frame::new(1, 2, 1, vec![10, 200]).unwrap();
        let b = Frame::new(1, 2, 1, vec![90, 40]).unwrap();
        let merged = Frame::pixelwise_max(&[a, b]).unwrap();
        assert_eq!(merged.data, vec![90, 200]);
    }

    #[test]
    fn pixelwise_max_rejects_mismatched_shapes() {
        let a = Frame::zeros(1, 2, 1);
        let b = Frame::zeros(2, 1, 1);
        let err = Frame::pixelwise_max(&[a, b]).unwrap_err();
        assert_eq!(
            err,
            PreprocessingError::ShapeMismatch {
                expected: (1, 2, 1),
                actual: (2, 1, 1)
            }
        );
    }

    #[test]
    fn pixelwise_max_needs_at_least_one_frame() {
        assert_eq!(
            Frame::pixelwise_max(&[]).unwrap_err(),
            PreprocessingError::EmptyStack
        );
    }

    #[test]
    fn concat_interleaves_channels_per_pixel() {
        let a = Frame::new(1, 2, 1, vec![1, 2]).unwrap();
        let b = Frame::new(1, 2, 2, vec![3, 4, 5, 6]).unwrap();
        let merged = Frame::concat_channels(&[&a, &b]).unwrap();
        assert_eq!(merged.shape(), (1, 2, 3));
        assert_eq!(merged.data, vec![1, 3, 4, 2, 5, 6]);
    }

    #[test]
    fn concat_rejects_mismatched_extents() {
        let a = Frame::zeros(2, 2, 1);
        let b = Frame::zeros(2, 3, 1);
        assert!(matches!(
            Frame::concat_channels(&[&a, &b]),
            Err(PreprocessingError::ShapeMismatch { .. })
        ));
    }
}
