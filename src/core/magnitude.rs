//! Vibration magnitude

use super::IngestError;

/// Euclidean norm of a 3-axis acceleration vector.
///
/// Non-finite components, or components large enough that the norm
/// overflows, are rejected as a malformed sample.
pub fn magnitude(ax: f64, ay: f64, az: f64) -> Result<f64, IngestError> {
    if !(ax.is_finite() && ay.is_finite() && az.is_finite()) {
        return Err(IngestError::MalformedSample(format!(
            "non-finite acceleration ({}, {}, {})",
            ax, ay, az
        )));
    }

    let value = (ax * ax + ay * ay + az * az).sqrt();
    if !value.is_finite() {
        return Err(IngestError::MalformedSample(format!(
            "acceleration ({}, {}, {}) overflows",
            ax, ay, az
        )));
    }

    Ok(value)
}
