//! CIP/EtherNet-IP address grammar and EPATH construction (spec §4.1, §6).
//!
//! Two address forms are recognised: symbolic (`Name`, `Name[index]`,
//! `Struct.Member`) and instance-based (`Symbol@instance.attribute`).
//! Grounded in the tag-name validation and request-path construction of the
//! `wellpulse` EtherNet/IP adapter, generalised into a structured segment
//! builder rather than raw byte twiddling (spec §4.1).

use crate::error::{GatewayError, Result};

/// One segment of a CIP request path. The scheduler/handler build a
/// `Vec<EpathSegment>` and only the wire encoder turns it into bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EpathSegment {
    Symbolic(String),
    ArrayIndex(u32),
    Class(u16),
    Instance(u32),
    Attribute(u16),
}

/// A parsed CIP address: the base tag name plus any qualifying segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipAddress {
    pub path: Vec<EpathSegment>,
    /// Original symbolic name, kept for diagnostics and `format`.
    canonical: String,
}

fn is_symbol_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

pub fn parse(address: &str) -> Result<CipAddress> {
    let invalid = |reason: &str| GatewayError::InvalidAddress {
        address: address.to_string(),
        reason: reason.to_string(),
    };

    if address.is_empty() {
        return Err(invalid("address is empty"));
    }

    if let Some(at) = address.find('@') {
        // Instance-based: `Symbol@instance.attribute`
        let (symbol, rest) = address.split_at(at);
        let rest = &rest[1..];
        if symbol.is_empty() || !symbol.chars().all(is_symbol_char) {
            return Err(invalid("symbol before '@' must be alphanumeric/underscore"));
        }
        let mut parts = rest.splitn(2, '.');
        let instance_str = parts.next().ok_or_else(|| invalid("missing instance after '@'"))?;
        let instance: u32 = instance_str.parse().map_err(|_| invalid("instance is not numeric"))?;
        let mut path = vec![EpathSegment::Symbolic(symbol.to_string()), EpathSegment::Instance(instance)];
        if let Some(attr_str) = parts.next() {
            let attr: u16 = attr_str.parse().map_err(|_| invalid("attribute is not numeric"))?;
            path.push(EpathSegment::Attribute(attr));
        }
        return Ok(CipAddress {
            path,
            canonical: address.to_string(),
        });
    }

    // Symbolic: `Name`, `Name[index]`, `Struct.Member`
    let mut path = Vec::new();
    for (i, member) in address.split('.').enumerate() {
        if member.is_empty() {
            return Err(invalid("empty segment between '.'"));
        }
        if let Some(bracket) = member.find('[') {
            if !member.ends_with(']') {
                return Err(invalid("unterminated '[' array index"));
            }
            let (name, idx_part) = member.split_at(bracket);
            let idx_str = &idx_part[1..idx_part.len() - 1];
            if name.is_empty() || !name.chars().all(is_symbol_char) {
                return Err(invalid("array name must be alphanumeric/underscore"));
            }
            let index: u32 = idx_str.parse().map_err(|_| invalid("array index is not numeric"))?;
            path.push(EpathSegment::Symbolic(name.to_string()));
            path.push(EpathSegment::ArrayIndex(index));
        } else {
            if !member.chars().all(is_symbol_char) {
                return Err(invalid(&format!("segment {} is not alphanumeric/underscore", i)));
            }
            path.push(EpathSegment::Symbolic(member.to_string()));
        }
    }

    Ok(CipAddress {
        path,
        canonical: address.to_string(),
    })
}

pub fn format(addr: &CipAddress) -> String {
    addr.canonical.clone()
}

/// CIP general status codes relevant to recoverable/permanent classification
/// (spec §7). Non-exhaustive; unlisted codes are treated as permanent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipGeneralStatus {
    Success,
    ObjectDoesNotExist,
    DeviceStateConflict,
    PathSegmentError,
    Other(u8),
}

impl CipGeneralStatus {
    pub fn from_code(code: u8) -> CipGeneralStatus {
        match code {
            0x00 => CipGeneralStatus::Success,
            0x05 => CipGeneralStatus::ObjectDoesNotExist,
            0x0C => CipGeneralStatus::DeviceStateConflict,
            0x04 => CipGeneralStatus::PathSegmentError,
            other => CipGeneralStatus::Other(other),
        }
    }

    /// Per spec §7: transient device-state conflicts are recoverable;
    /// object-does-not-exist and path errors are permanent.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CipGeneralStatus::DeviceStateConflict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_symbolic_name() {
        let a = parse("Temperature").unwrap();
        assert_eq!(a.path, vec![EpathSegment::Symbolic("Temperature".into())]);
    }

    #[test]
    fn parses_array_index_form() {
        let a = parse("Motor[3]").unwrap();
        assert_eq!(a.path, vec![EpathSegment::Symbolic("Motor".into()), EpathSegment::ArrayIndex(3)]);
    }

    #[test]
    fn parses_struct_member_form() {
        let a = parse("Struct.Member").unwrap();
        assert_eq!(
            a.path,
            vec![EpathSegment::Symbolic("Struct".into()), EpathSegment::Symbolic("Member".into())]
        );
    }

    #[test]
    fn parses_instance_based_form() {
        let a = parse("Symbol@5.2").unwrap();
        assert_eq!(
            a.path,
            vec![
                EpathSegment::Symbolic("Symbol".into()),
                EpathSegment::Instance(5),
                EpathSegment::Attribute(2),
            ]
        );
    }

    #[test]
    fn rejects_malformed_array_and_empty_segments() {
        assert!(parse("Motor[").is_err());
        assert!(parse("Motor[abc]").is_err());
        assert!(parse("Struct..Member").is_err());
        assert!(parse("").is_err());
        assert!(parse("bad-name!").is_err());
    }

    #[test]
    fn format_is_left_inverse_of_parse() {
        for s in ["Temperature", "Motor[3]", "Struct.Member", "Symbol@5.2"] {
            let parsed = parse(s).unwrap();
            assert_eq!(format(&parsed), s);
        }
    }

    #[test]
    fn device_state_conflict_is_the_only_recoverable_status() {
        assert!(CipGeneralStatus::from_code(0x0C).is_recoverable());
        assert!(!CipGeneralStatus::from_code(0x05).is_recoverable());
    }
}
