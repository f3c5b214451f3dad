//! Resource quantity helpers
//!
//! Only the subset of quantity arithmetic the operator needs: accelerator
//! counts must denote whole numbers, everything else is passed through
//! untouched.

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

/// Extended resource name for NVIDIA GPUs
pub const NVIDIA_GPU_RESOURCE: &str = "nvidia.com/gpu";

/// Parse a whole-device count such as an extended GPU resource
///
/// Any quantity notation is accepted (`2`, `2000m`, `1e1`, `0.002k`) as long
/// as the value it denotes is a non-negative whole number.
pub fn parse_device_count(quantity: &Quantity) -> Result<u32, String> {
    let raw = quantity.0.trim();
    if raw.is_empty() {
        return Err("device quantity cannot be empty".to_string());
    }
    let invalid = |reason: &str| format!("invalid device quantity '{}': {}", raw, reason);

    let (negative, unsigned) = match raw.as_bytes()[0] {
        b'-' => (true, &raw[1..]),
        b'+' => (false, &raw[1..]),
        _ => (false, raw),
    };
    let number_len = unsigned
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(unsigned.len());
    let (number, suffix) = unsigned.split_at(number_len);

    let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
    if (whole.is_empty() && fraction.is_empty()) || fraction.contains('.') {
        return Err(invalid("not a number"));
    }
    let (binary_power, suffix_exponent) =
        suffix_scale(suffix).ok_or_else(|| invalid("unknown suffix"))?;

    let fraction = fraction.trim_end_matches('0');
    let digits = format!("{whole}{fraction}");
    let digits = digits.trim_start_matches('0');
    let mut exponent = suffix_exponent - fraction.len() as i32;

    let mut value: u128 = if digits.is_empty() {
        0
    } else {
        digits.parse().map_err(|_| invalid("too large"))?
    };
    value = 1024u128
        .checked_pow(binary_power)
        .and_then(|scale| value.checked_mul(scale))
        .ok_or_else(|| invalid("too large"))?;

    while value != 0 && exponent > 0 {
        value = value.checked_mul(10).ok_or_else(|| invalid("too large"))?;
        exponent -= 1;
    }
    while value != 0 && exponent < 0 {
        if value % 10 != 0 {
            return Err(invalid("must be a whole number"));
        }
        value /= 10;
        exponent += 1;
    }

    if negative && value != 0 {
        return Err(invalid("must not be negative"));
    }
    u32::try_from(value).map_err(|_| invalid("too large"))
}

/// Binary power of 1024 and decimal exponent denoted by a quantity suffix
fn suffix_scale(suffix: &str) -> Option<(u32, i32)> {
    let scale = match suffix {
        "" => (0, 0),
        "n" => (0, -9),
        "u" => (0, -6),
        "m" => (0, -3),
        "k" => (0, 3),
        "M" => (0, 6),
        "G" => (0, 9),
        "T" => (0, 12),
        "P" => (0, 15),
        "E" => (0, 18),
        "Ki" => (1, 0),
        "Mi" => (2, 0),
        "Gi" => (3, 0),
        "Ti" => (4, 0),
        "Pi" => (5, 0),
        "Ei" => (6, 0),
        _ => {
            let exponent = suffix.strip_prefix(['e', 'E'])?;
            let unsigned = exponent.strip_prefix(['+', '-']).unwrap_or(exponent);
            if unsigned.is_empty() || !unsigned.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }
            (0, exponent.parse().ok()?)
        }
    };
    Some(scale)
}

/// Quantity for a whole number of devices
pub fn device_quantity(count: u32) -> Quantity {
    Quantity(count.to_string())
}
