use crate::model::ComponentKind;
use crate::vector::l2_normalize;

/// Weighted mean over the present components, renormalized by the sum of
/// their weights, then scaled to unit length. A zero result stays zero.
/// Returns `None` when nothing is present.
pub fn compose_final(components: &[(ComponentKind, &[f32])]) -> Option<Vec<f32>> {
    let (_, first) = components.first()?;
    let dims = first.len();

    let mut raw = vec![0_f64; dims];
    let mut weight_sum = 0_f64;
    for (kind, values) in components {
        let weight = kind.weight();
        weight_sum += weight;
        for (slot, value) in raw.iter_mut().zip(values.iter()) {
            *slot += weight * f64::from(*value);
        }
    }

    for slot in raw.iter_mut() {
        *slot /= weight_sum;
    }
    l2_normalize(&mut raw);

    Some(raw.into_iter().map(|value| value as f32).collect())
}
