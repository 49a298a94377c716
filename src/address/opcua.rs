//! OPC-UA node-id grammar (spec §4.1, §6).
//!
//! Node IDs follow `ns=<n>;<i|s|g|b>=<value>` or the bare `<i|s>=<value>`
//! form with implicit namespace 0.

use crate::error::{GatewayError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentifierKind {
    Numeric,
    String,
    Guid,
    Opaque,
}

impl IdentifierKind {
    fn from_tag(tag: char) -> Option<IdentifierKind> {
        match tag {
            'i' => Some(IdentifierKind::Numeric),
            's' => Some(IdentifierKind::String),
            'g' => Some(IdentifierKind::Guid),
            'b' => Some(IdentifierKind::Opaque),
            _ => None,
        }
    }

    fn tag(&self) -> char {
        match self {
            IdentifierKind::Numeric => 'i',
            IdentifierKind::String => 's',
            IdentifierKind::Guid => 'g',
            IdentifierKind::Opaque => 'b',
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpcUaNodeId {
    pub namespace: u16,
    pub kind: IdentifierKind,
    pub identifier: String,
}

pub fn parse(address: &str) -> Result<OpcUaNodeId> {
    let invalid = |reason: &str| GatewayError::InvalidAddress {
        address: address.to_string(),
        reason: reason.to_string(),
    };

    let (namespace, rest) = if let Some(body) = address.strip_prefix("ns=") {
        let mut parts = body.splitn(2, ';');
        let ns_str = parts.next().ok_or_else(|| invalid("missing ';' after namespace"))?;
        let namespace: u16 = ns_str.parse().map_err(|_| invalid("namespace is not numeric"))?;
        let rest = parts.next().ok_or_else(|| invalid("missing identifier after namespace"))?;
        (namespace, rest)
    } else {
        (0, address)
    };

    let mut kv = rest.splitn(2, '=');
    let tag_str = kv.next().ok_or_else(|| invalid("missing identifier-kind tag"))?;
    let value = kv.next().ok_or_else(|| invalid("missing '=' before identifier value"))?;
    if tag_str.len() != 1 {
        return Err(invalid("identifier-kind tag must be a single character"));
    }
    let kind = IdentifierKind::from_tag(tag_str.chars().next().unwrap())
        .ok_or_else(|| invalid("identifier-kind must be one of i, s, g, b"))?;
    if value.is_empty() {
        return Err(invalid("identifier value is empty"));
    }
    if kind == IdentifierKind::Numeric && value.parse::<u32>().is_err() {
        return Err(invalid("numeric identifier is not a valid u32"));
    }

    Ok(OpcUaNodeId {
        namespace,
        kind,
        identifier: value.to_string(),
    })
}

pub fn format(node: &OpcUaNodeId) -> String {
    if node.namespace == 0 {
        format!("{}={}", node.kind.tag(), node.identifier)
    } else {
        format!("ns={};{}={}", node.namespace, node.kind.tag(), node.identifier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_numeric_with_implicit_namespace_zero() {
        let n = parse("i=85").unwrap();
        assert_eq!(n.namespace, 0);
        assert_eq!(n.kind, IdentifierKind::Numeric);
        assert_eq!(n.identifier, "85");
    }

    #[test]
    fn parses_full_form_with_namespace() {
        let n = parse("ns=2;s=Temperature").unwrap();
        assert_eq!(n.namespace, 2);
        assert_eq!(n.kind, IdentifierKind::String);
        assert_eq!(n.identifier, "Temperature");
    }

    #[test]
    fn rejects_bad_kind_tag_and_non_numeric_numeric_identifier() {
        assert!(parse("ns=2;x=Temperature").is_err());
        assert!(parse("i=not-a-number").is_err());
        assert!(parse("ns=abc;i=1").is_err());
    }

    #[test]
    fn format_is_left_inverse_of_parse() {
        for s in ["i=85", "s=Temperature", "ns=2;s=Temperature", "ns=7;g=abcd", "ns=1;b=ff00"] {
            let parsed = parse(s).unwrap();
            assert_eq!(format(&parsed), s);
        }
    }
}
