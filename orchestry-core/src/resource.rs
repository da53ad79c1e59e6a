//! Resource quantity parsing.
//!
//! Manifests declare resource limits the way Kubernetes does: cpu as whole
//! cores or millicores (`"2"`, `"0.5"`, `"500m"`), memory as bytes with an
//! optional binary suffix (`"256Mi"`, `"1Gi"`).

use crate::ValidationError;

/// Parse a cpu quantity into fractional cores (`"500m"` → `0.5`).
pub fn parse_cpu(quantity: &str) -> Result<f64, ValidationError> {
    let q = quantity.trim();
    let parsed = if let Some(milli) = q.strip_suffix('m') {
        milli.parse::<f64>().ok().map(|m| m / 1000.0)
    } else {
        q.parse::<f64>().ok()
    };
    match parsed {
        Some(cores) if cores > 0.0 && cores.is_finite() => Ok(cores),
        _ => Err(ValidationError::InvalidQuantity(quantity.to_string())),
    }
}

/// Parse a memory quantity into bytes (`"256Mi"` → `268435456`).
pub fn parse_memory(quantity: &str) -> Result<u64, ValidationError> {
    let q = quantity.trim();
    let (digits, multiplier) = match q {
        _ if q.ends_with("Ki") => (&q[..q.len() - 2], 1u64 << 10),
        _ if q.ends_with("Mi") => (&q[..q.len() - 2], 1u64 << 20),
        _ if q.ends_with("Gi") => (&q[..q.len() - 2], 1u64 << 30),
        _ => (q, 1u64),
    };
    match digits.parse::<u64>() {
        Ok(n) if n > 0 => n
            .checked_mul(multiplier)
            .ok_or_else(|| ValidationError::InvalidQuantity(quantity.to_string())),
        _ => Err(ValidationError::InvalidQuantity(quantity.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_millicores() {
        assert_eq!(parse_cpu("500m").unwrap(), 0.5);
        assert_eq!(parse_cpu("2").unwrap(), 2.0);
        assert_eq!(parse_cpu("0.25").unwrap(), 0.25);
    }

    #[test]
    fn cpu_rejects_garbage() {
        assert!(parse_cpu("").is_err());
        assert!(parse_cpu("-1").is_err());
        assert!(parse_cpu("fast").is_err());
    }

    #[test]
    fn memory_suffixes() {
        assert_eq!(parse_memory("256Mi").unwrap(), 256 * 1024 * 1024);
        assert_eq!(parse_memory("1Gi").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_memory("8Ki").unwrap(), 8192);
        assert_eq!(parse_memory("1048576").unwrap(), 1_048_576);
    }

    #[test]
    fn memory_rejects_garbage() {
        assert!(parse_memory("lots").is_err());
        assert!(parse_memory("0Mi").is_err());
        assert!(parse_memory("1.5Gi").is_err());
    }
}
