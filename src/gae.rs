// =============================================================================
// Generalized Advantage Estimation
// =============================================================================

/// Raw GAE over one trajectory segment, computed back to front:
///
///   delta_t = r_t + gamma * V(s_{t+1}) * (1 - done_t) - V(s_t)
///   A_t     = delta_t + gamma * lam * (1 - done_t) * A_{t+1}
///
/// `last_value` bootstraps the step after the segment ends; a terminal flag
/// zeroes both the bootstrap and the propagation, so segments may span
/// several episodes. Reference: <https://arxiv.org/pdf/1707.06347.pdf>
pub fn estimate_advantages(
    rewards: &[f32],
    values: &[f32],
    dones: &[bool],
    last_value: f32,
    gamma: f32,
    lam: f32,
) -> Vec<f32> {
    assert_eq!(rewards.len(), values.len());
    assert_eq!(rewards.len(), dones.len());
    let n = rewards.len();
    let mut advantages = vec![0.0f32; n];
    let mut last_adv = 0.0f32;
    for t in (0..n).rev() {
        let not_done = if dones[t] { 0.0 } else { 1.0 };
        let next_value = if t + 1 < n { values[t + 1] } else { last_value };
        let delta = rewards[t] + gamma * next_value * not_done - values[t];
        last_adv = delta + gamma * lam * not_done * last_adv;
        advantages[t] = last_adv;
    }
    advantages
}

/// `(A - mean) / (std + eps)` with population std and the float32 machine
/// epsilon, so a constant input maps to zeros instead of NaN.
pub fn normalize_advantages(advantages: &[f32]) -> Vec<f32> {
    if advantages.is_empty() {
        return Vec::new();
    }
    let n = advantages.len() as f32;
    let mean = advantages.iter().sum::<f32>() / n;
    let var = advantages.iter().map(|a| (a - mean) * (a - mean)).sum::<f32>() / n;
    let std = var.sqrt();
    advantages
        .iter()
        .map(|a| (a - mean) / (std + f32::EPSILON))
        .collect()
}
