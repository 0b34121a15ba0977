//! Transport representation of encrypted form fields.
//!
//! A field is a single RSA ciphertext, an ordered list of ciphertext chunks, or
//! a nested map of further fields. On the wire every ciphertext is lowercase
//! hex and structure is carried in bracketed form keys:
//!
//! ```text
//! name=ab12...                 scalar
//! message[0]=..&message[1]=..  chunked, index order is plaintext order
//! address[street]=..           nested
//! ```
//!
//! Plaintext is encrypted as raw bytes. It is not base64-encoded before RSA,
//! so a peer that pre-encodes plaintext will not interoperate and chunk
//! counts follow the raw byte length.

use std::collections::BTreeMap;

use crate::error::{CryptoError, CryptoResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncryptedField {
    Scalar(Vec<u8>),
    Chunked(Vec<Vec<u8>>),
    Nested(BTreeMap<String, EncryptedField>),
}

impl EncryptedField {
    /// Number of ciphertext blocks carried by this field, nested included.
    pub fn block_count(&self) -> usize {
        match self {
            EncryptedField::Scalar(_) => 1,
            EncryptedField::Chunked(chunks) => chunks.len(),
            EncryptedField::Nested(map) => map.values().map(EncryptedField::block_count).sum(),
        }
    }

    /// Encode under `name` as ordered form pairs.
    pub fn to_form_pairs(&self, name: &str) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        self.push_pairs(name, &mut pairs);
        pairs
    }

    fn push_pairs(&self, name: &str, pairs: &mut Vec<(String, String)>) {
        match self {
            EncryptedField::Scalar(block) => pairs.push((name.to_string(), hex::encode(block))),
            EncryptedField::Chunked(chunks) => {
                for (index, block) in chunks.iter().enumerate() {
                    pairs.push((format!("{}[{}]", name, index), hex::encode(block)));
                }
            }
            EncryptedField::Nested(map) => {
                for (key, field) in map {
                    field.push_pairs(&format!("{}[{}]", name, key), pairs);
                }
            }
        }
    }
}

/// Split `name[a][b]` into `("name", ["a", "b"])`.
pub fn split_key(key: &str) -> CryptoResult<(&str, Vec<&str>)> {
    let Some(open) = key.find('[') else {
        return Ok((key, Vec::new()));
    };
    let base = &key[..open];
    if base.is_empty() {
        return Err(CryptoError::MalformedField(format!("empty field name in {}", key)));
    }
    let mut segments = Vec::new();
    let mut rest = &key[open..];
    while !rest.is_empty() {
        if !rest.starts_with('[') {
            return Err(CryptoError::MalformedField(format!("bad key syntax: {}", key)));
        }
        let close = rest
            .find(']')
            .ok_or_else(|| CryptoError::MalformedField(format!("unclosed bracket: {}", key)))?;
        segments.push(&rest[1..close]);
        rest = &rest[close + 1..];
    }
    Ok((base, segments))
}

#[derive(Default)]
struct Node {
    value: Option<Vec<u8>>,
    children: BTreeMap<String, Node>,
}

impl Node {
    fn insert(&mut self, path: &[&str], block: Vec<u8>, key: &str) -> CryptoResult<()> {
        match path.split_first() {
            None => {
                if self.value.is_some() || !self.children.is_empty() {
                    return Err(CryptoError::MalformedField(format!("duplicate key {}", key)));
                }
                self.value = Some(block);
                Ok(())
            }
            Some((head, tail)) => {
                if self.value.is_some() {
                    return Err(CryptoError::MalformedField(format!("duplicate key {}", key)));
                }
                self.children
                    .entry(head.to_string())
                    .or_default()
                    .insert(tail, block, key)
            }
        }
    }

    fn into_field(self, name: &str) -> CryptoResult<EncryptedField> {
        if let Some(block) = self.value {
            return Ok(EncryptedField::Scalar(block));
        }
        let all_numeric = self
            .children
            .keys()
            .all(|k| !k.is_empty() && k.bytes().all(|b| b.is_ascii_digit()));
        if all_numeric && self.children.values().all(|c| c.children.is_empty()) {
            let mut indexed = Vec::with_capacity(self.children.len());
            for (index, node) in self.children {
                let position: usize = index
                    .parse()
                    .map_err(|_| CryptoError::MalformedField(format!("bad index in {}", name)))?;
                let block = node.value.ok_or_else(|| {
                    CryptoError::MalformedField(format!("empty chunk in {}", name))
                })?;
                indexed.push((position, block));
            }
            indexed.sort_by_key(|(position, _)| *position);
            for (expected, (position, _)) in indexed.iter().enumerate() {
                if *position != expected {
                    return Err(CryptoError::MalformedField(format!(
                        "chunk {} missing from {}",
                        expected, name
                    )));
                }
            }
            return Ok(EncryptedField::Chunked(
                indexed.into_iter().map(|(_, block)| block).collect(),
            ));
        }
        let mut map = BTreeMap::new();
        for (key, node) in self.children {
            let field = node.into_field(&format!("{}[{}]", name, key))?;
            map.insert(key, field);
        }
        Ok(EncryptedField::Nested(map))
    }
}

/// Rebuild encrypted fields from ordered form pairs.
///
/// Top-level order follows the first appearance of each field name.
pub fn parse_fields<'a, I>(pairs: I) -> CryptoResult<Vec<(String, EncryptedField)>>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut order: Vec<String> = Vec::new();
    let mut roots: BTreeMap<String, Node> = BTreeMap::new();
    for (key, value) in pairs {
        let (base, path) = split_key(key)?;
        let block = hex::decode(value.trim()).map_err(|_| {
            CryptoError::MalformedField(format!("{} is not hex encoded", key))
        })?;
        if !roots.contains_key(base) {
            order.push(base.to_string());
        }
        roots
            .entry(base.to_string())
            .or_default()
            .insert(&path, block, key)?;
    }
    let mut fields = Vec::with_capacity(order.len());
    for name in order {
        if let Some(node) = roots.remove(&name) {
            let field = node.into_field(&name)?;
            fields.push((name, field));
        }
    }
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_key() {
        assert_eq!(split_key("name").unwrap(), ("name", vec![]));
        assert_eq!(split_key("msg[0]").unwrap(), ("msg", vec!["0"]));
        assert_eq!(split_key("a[b][1]").unwrap(), ("a", vec!["b", "1"]));
        assert!(split_key("[0]").is_err());
        assert!(split_key("a[0").is_err());
        assert!(split_key("a[0]x").is_err());
    }

    #[test]
    fn test_chunks_ordered_by_index_not_arrival() {
        let fields =
            parse_fields(vec![("msg[1]", "0b"), ("msg[0]", "0a"), ("msg[2]", "0c")]).unwrap();
        assert_eq!(fields.len(), 1);
        assert_eq!(
            fields[0].1,
            EncryptedField::Chunked(vec![vec![0x0a], vec![0x0b], vec![0x0c]])
        );
    }

    #[test]
    fn test_numeric_ordering_past_nine() {
        let pairs: Vec<(String, String)> = (0..12)
            .rev()
            .map(|i| (format!("m[{}]", i), format!("{:02x}", i)))
            .collect();
        let fields = parse_fields(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))).unwrap();
        let EncryptedField::Chunked(chunks) = &fields[0].1 else {
            panic!("expected chunked field");
        };
        let order: Vec<u8> = chunks.iter().map(|c| c[0]).collect();
        assert_eq!(order, (0..12).collect::<Vec<u8>>());
    }

    #[test]
    fn test_missing_chunk_rejected() {
        let err = parse_fields(vec![("msg[0]", "00"), ("msg[2]", "02")]).unwrap_err();
        assert!(matches!(err, CryptoError::MalformedField(_)));
    }

    #[test]
    fn test_nested_and_top_level_order() {
        let fields = parse_fields(vec![
            ("zeta", "01"),
            ("addr[street]", "02"),
            ("addr[city][0]", "03"),
            ("addr[city][1]", "04"),
            ("alpha", "05"),
        ])
        .unwrap();
        let names: Vec<&str> = fields.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["zeta", "addr", "alpha"]);
        let EncryptedField::Nested(map) = &fields[1].1 else {
            panic!("expected nested field");
        };
        assert_eq!(map["street"], EncryptedField::Scalar(vec![2]));
        assert_eq!(map["city"], EncryptedField::Chunked(vec![vec![3], vec![4]]));
        assert_eq!(fields[1].1.block_count(), 3);
    }

    #[test]
    fn test_form_pairs_reparse() {
        let field = EncryptedField::Chunked(vec![vec![1, 2], vec![3]]);
        let pairs = field.to_form_pairs("body");
        assert_eq!(pairs[0], ("body[0]".to_string(), "0102".to_string()));
        let parsed = parse_fields(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))).unwrap();
        assert_eq!(parsed[0].1, field);
    }

    #[test]
    fn test_duplicate_and_non_hex_rejected() {
        assert!(parse_fields(vec![("a", "00"), ("a", "01")]).is_err());
        assert!(parse_fields(vec![("a", "zz")]).is_err());
    }
}
