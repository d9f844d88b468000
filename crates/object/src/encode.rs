//! Canonical byte encoding.
//!
//! The encoding must be byte-for-byte deterministic across implementations:
//! fields in recipe-declared order, length-prefixed UTF-8 strings, fixed
//! 8-byte little-endian integers and IEEE-754 doubles, one tag byte for
//! optional fields, and set elements sorted by the SHA-256 of their own
//! encoding. The hash of these bytes is the object's identity in the store.

use sha2::{Digest, Sha256};

use crate::error::ObjectError;
use crate::hash::{ContentHash, HASH_LEN, IdHash};
use crate::recipe::{FieldRule, ItemType, Recipe, RecipeRegistry};
use crate::value::{ObjectData, Value};

/// Nesting bound; exceeding it means a cyclic or degenerate object graph.
const MAX_DEPTH: usize = 32;

const TAG_ABSENT: u8 = 0x00;
const TAG_PRESENT: u8 = 0x01;

/// SHA-256 over the full canonical encoding.
pub fn content_hash(registry: &RecipeRegistry, data: &ObjectData) -> Result<ContentHash, ObjectError> {
    Ok(ContentHash::of(&canonical_encode(registry, data)?))
}

/// SHA-256 over the canonical encoding restricted to identity fields.
pub fn id_hash(registry: &RecipeRegistry, data: &ObjectData) -> Result<IdHash, ObjectError> {
    let recipe = registry.get(data.kind())?;
    let mut out = Vec::new();
    encode_str(&mut out, &recipe.name);
    for rule in recipe.id_rules() {
        encode_field(registry, &mut out, data, rule, 0)?;
    }
    Ok(IdHash::of(&out))
}

/// Full canonical encoding: recipe name, then every field in recipe order.
pub fn canonical_encode(
    registry: &RecipeRegistry,
    data: &ObjectData,
) -> Result<Vec<u8>, ObjectError> {
    let mut out = Vec::new();
    encode_object(registry, &mut out, data, 0)?;
    Ok(out)
}

/// Decode canonical bytes back into an [`ObjectData`]. The leading recipe
/// name selects the schema that drives field decoding.
pub fn canonical_decode(
    registry: &RecipeRegistry,
    bytes: &[u8],
) -> Result<ObjectData, ObjectError> {
    let mut reader = Reader::new(bytes);
    let data = decode_object(registry, &mut reader, 0)?;
    if !reader.is_empty() {
        return Err(ObjectError::InvalidEncoding(format!(
            "{} trailing bytes after object",
            reader.remaining()
        )));
    }
    Ok(data)
}

fn encode_object(
    registry: &RecipeRegistry,
    out: &mut Vec<u8>,
    data: &ObjectData,
    depth: usize,
) -> Result<(), ObjectError> {
    if depth > MAX_DEPTH {
        return Err(ObjectError::InvalidEncoding(
            "object nesting exceeds canonical depth bound".into(),
        ));
    }
    let recipe = registry.get(data.kind())?;
    encode_str(out, &recipe.name);
    for rule in &recipe.rules {
        encode_field(registry, out, data, rule, depth)?;
    }
    Ok(())
}

fn encode_field(
    registry: &RecipeRegistry,
    out: &mut Vec<u8>,
    data: &ObjectData,
    rule: &FieldRule,
    depth: usize,
) -> Result<(), ObjectError> {
    match data.get(&rule.itemprop) {
        None if rule.optional => out.push(TAG_ABSENT),
        None => {
            return Err(ObjectError::InvalidEncoding(format!(
                "{}: required field `{}` absent at encode time",
                data.kind(),
                rule.itemprop
            )));
        }
        Some(value) => {
            if rule.optional {
                out.push(TAG_PRESENT);
            }
            encode_value(registry, out, value, &rule.itemtype, depth)?;
        }
    }
    Ok(())
}

fn encode_value(
    registry: &RecipeRegistry,
    out: &mut Vec<u8>,
    value: &Value,
    itemtype: &ItemType,
    depth: usize,
) -> Result<(), ObjectError> {
    match (itemtype, value) {
        (ItemType::Bool, Value::Bool(v)) => out.push(u8::from(*v)),
        (ItemType::Int, Value::Int(v)) => out.extend_from_slice(&v.to_le_bytes()),
        (ItemType::Number, Value::Number(v)) => {
            if v.is_nan() {
                return Err(ObjectError::InvalidEncoding(
                    "NaN is forbidden in hashed fields".into(),
                ));
            }
            out.extend_from_slice(&v.to_le_bytes());
        }
        (ItemType::Text, Value::Text(v)) => encode_str(out, v),
        (ItemType::ArrayOf(inner), Value::Array(elements)) => {
            out.extend_from_slice(&(elements.len() as u64).to_le_bytes());
            for element in elements {
                encode_value(registry, out, element, inner, depth)?;
            }
        }
        (ItemType::SetOf(inner), Value::Set(elements)) => {
            // Canonical order: elements sorted by the hash of their own
            // encoding, duplicates collapsed.
            let mut encoded: Vec<([u8; HASH_LEN], Vec<u8>)> = Vec::with_capacity(elements.len());
            for element in elements {
                let mut buf = Vec::new();
                encode_value(registry, &mut buf, element, inner, depth)?;
                let digest: [u8; HASH_LEN] = Sha256::digest(&buf).into();
                encoded.push((digest, buf));
            }
            encoded.sort_by(|(a, _), (b, _)| a.cmp(b));
            encoded.dedup_by(|(a, _), (b, _)| a == b);
            out.extend_from_slice(&(encoded.len() as u64).to_le_bytes());
            for (_, bytes) in encoded {
                out.extend_from_slice(&bytes);
            }
        }
        (ItemType::ReferenceTo(_), Value::Reference(hash)) => {
            out.extend_from_slice(hash.as_bytes());
        }
        (ItemType::ReferenceToId(_), Value::IdReference(hash)) => {
            out.extend_from_slice(hash.as_bytes());
        }
        (ItemType::Nested(_), Value::Object(nested)) => {
            encode_object(registry, out, nested, depth + 1)?;
        }
        (expected, found) => {
            return Err(ObjectError::InvalidEncoding(format!(
                "cannot encode {} as {}",
                found.type_name(),
                expected.render()
            )));
        }
    }
    Ok(())
}

fn encode_str(out: &mut Vec<u8>, value: &str) {
    out.extend_from_slice(&(value.len() as u64).to_le_bytes());
    out.extend_from_slice(value.as_bytes());
}

// ── Decoding ──────────────────────────────────────────────────────────────

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8], ObjectError> {
        if self.remaining() < count {
            return Err(ObjectError::InvalidEncoding(format!(
                "truncated object: needed {count} bytes, {} left",
                self.remaining()
            )));
        }
        let slice = &self.bytes[self.pos..self.pos + count];
        self.pos += count;
        Ok(slice)
    }

    fn byte(&mut self) -> Result<u8, ObjectError> {
        Ok(self.take(1)?[0])
    }

    fn u64(&mut self) -> Result<u64, ObjectError> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(buf))
    }

    fn i64(&mut self) -> Result<i64, ObjectError> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(i64::from_le_bytes(buf))
    }

    fn f64(&mut self) -> Result<f64, ObjectError> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(f64::from_le_bytes(buf))
    }

    fn str(&mut self) -> Result<String, ObjectError> {
        let len = self.u64()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| ObjectError::InvalidEncoding("invalid UTF-8 in string field".into()))
    }

    fn hash(&mut self) -> Result<[u8; HASH_LEN], ObjectError> {
        let mut buf = [0u8; HASH_LEN];
        buf.copy_from_slice(self.take(HASH_LEN)?);
        Ok(buf)
    }
}

fn decode_object(
    registry: &RecipeRegistry,
    reader: &mut Reader<'_>,
    depth: usize,
) -> Result<ObjectData, ObjectError> {
    if depth > MAX_DEPTH {
        return Err(ObjectError::InvalidEncoding(
            "object nesting exceeds canonical depth bound".into(),
        ));
    }
    let kind = reader.str()?;
    let recipe: Recipe = registry.get(&kind)?.as_ref().clone();
    let mut data = ObjectData::new(&kind);
    for rule in &recipe.rules {
        if rule.optional {
            match reader.byte()? {
                TAG_ABSENT => continue,
                TAG_PRESENT => {}
                tag => {
                    return Err(ObjectError::InvalidEncoding(format!(
                        "{kind}: bad optional tag {tag:#04x} for `{}`",
                        rule.itemprop
                    )));
                }
            }
        }
        let value = decode_value(registry, reader, &rule.itemtype, depth)?;
        data.set(&rule.itemprop, value);
    }
    Ok(data)
}

fn decode_value(
    registry: &RecipeRegistry,
    reader: &mut Reader<'_>,
    itemtype: &ItemType,
    depth: usize,
) -> Result<Value, ObjectError> {
    Ok(match itemtype {
        ItemType::Bool => match reader.byte()? {
            0 => Value::Bool(false),
            1 => Value::Bool(true),
            other => {
                return Err(ObjectError::InvalidEncoding(format!(
                    "bad bool byte {other:#04x}"
                )));
            }
        },
        ItemType::Int => Value::Int(reader.i64()?),
        ItemType::Number => {
            let number = reader.f64()?;
            if number.is_nan() {
                return Err(ObjectError::InvalidEncoding(
                    "NaN is forbidden in hashed fields".into(),
                ));
            }
            Value::Number(number)
        }
        ItemType::Text => Value::Text(reader.str()?),
        ItemType::ArrayOf(inner) => {
            let len = reader.u64()? as usize;
            let mut elements = Vec::with_capacity(len.min(1024));
            for _ in 0..len {
                elements.push(decode_value(registry, reader, inner, depth)?);
            }
            Value::Array(elements)
        }
        ItemType::SetOf(inner) => {
            let len = reader.u64()? as usize;
            let mut elements = Vec::with_capacity(len.min(1024));
            for _ in 0..len {
                elements.push(decode_value(registry, reader, inner, depth)?);
            }
            Value::Set(elements)
        }
        ItemType::ReferenceTo(_) => Value::Reference(ContentHash::from_bytes(reader.hash()?)),
        ItemType::ReferenceToId(_) => Value::IdReference(IdHash::from_bytes(reader.hash()?)),
        ItemType::Nested(_) => Value::Object(decode_object(registry, reader, depth + 1)?),
    })
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::{canonical_decode, canonical_encode, content_hash, id_hash};
    use crate::recipe::{RecipeRegistry, recipes};
    use crate::value::{ObjectData, Value, text, text_set};

    fn registry() -> RecipeRegistry {
        RecipeRegistry::with_builtins()
    }

    fn subject(keywords: &[&str], message_count: i64) -> ObjectData {
        ObjectData::new(recipes::SUBJECT)
            .with("topicId", text("t1"))
            .with("keywordSetHash", text("kh"))
            .with("name", text(keywords.join(" / ")))
            .with("keywords", text_set(keywords.to_vec()))
            .with("messageCount", Value::Int(message_count))
            .with("timestamp", Value::Int(1_700_000_000_000))
            .with("archived", Value::Bool(false))
    }

    #[test]
    fn encoding_round_trips_and_preserves_content_hash() -> Result<()> {
        let registry = registry();
        let original = subject(&["pizza", "dough", "yeast"], 3);
        let bytes = canonical_encode(&registry, &original)?;
        let decoded = canonical_decode(&registry, &bytes)?;
        assert_eq!(
            content_hash(&registry, &decoded)?,
            content_hash(&registry, &original)?
        );
        Ok(())
    }

    #[test]
    fn set_order_does_not_affect_the_hash() -> Result<()> {
        let registry = registry();
        let a = subject(&["pizza", "dough", "yeast"], 3);
        let b = subject(&["yeast", "pizza", "dough"], 3);
        assert_eq!(content_hash(&registry, &a)?, content_hash(&registry, &b)?);
        Ok(())
    }

    #[test]
    fn array_order_is_hash_significant() -> Result<()> {
        let registry = registry();
        let nested = |w: f64, id: &[u8; 32]| {
            Value::Object(
                ObjectData::new(recipes::SUMMARY_SUBJECT)
                    .with("subject", Value::IdReference(crate::IdHash::from_bytes(*id)))
                    .with("weight", Value::Number(w)),
            )
        };
        let summary = |subjects: Vec<Value>| {
            ObjectData::new(recipes::SUMMARY)
                .with("topicId", text("t1"))
                .with("version", Value::Int(1))
                .with("content", text("overview"))
                .with("subjects", Value::Array(subjects))
        };
        let first = summary(vec![nested(0.6, &[1; 32]), nested(0.4, &[2; 32])]);
        let second = summary(vec![nested(0.4, &[2; 32]), nested(0.6, &[1; 32])]);
        assert_ne!(
            content_hash(&registry, &first)?,
            content_hash(&registry, &second)?
        );
        Ok(())
    }

    #[test]
    fn id_hash_is_stable_across_non_identity_edits() -> Result<()> {
        let registry = registry();
        let original = subject(&["pizza", "dough"], 1);
        let edited = subject(&["pizza", "dough"], 9);
        assert_eq!(id_hash(&registry, &original)?, id_hash(&registry, &edited)?);
        assert_ne!(
            content_hash(&registry, &original)?,
            content_hash(&registry, &edited)?
        );
        Ok(())
    }

    #[test]
    fn recipe_name_separates_hash_domains() -> Result<()> {
        // Same single text id field, different kinds.
        let registry = registry();
        let topic = ObjectData::new(recipes::TOPIC)
            .with("topicId", text("x"))
            .with("sharingEnabled", Value::Bool(false))
            .with("createdAt", Value::Int(0));
        let cursor = ObjectData::new(recipes::ANALYSIS_CURSOR).with("topicId", text("x"));
        assert_ne!(id_hash(&registry, &topic)?, id_hash(&registry, &cursor)?);
        Ok(())
    }

    #[test]
    fn nan_fails_encoding() {
        let registry = registry();
        let broken = ObjectData::new(recipes::SUMMARY_SUBJECT)
            .with("subject", Value::IdReference(crate::IdHash::from_bytes([0; 32])))
            .with("weight", Value::Number(f64::NAN));
        let summary = ObjectData::new(recipes::SUMMARY)
            .with("topicId", text("t1"))
            .with("version", Value::Int(1))
            .with("content", text("overview"))
            .with("subjects", Value::Array(vec![Value::Object(broken)]));
        assert!(canonical_encode(&registry, &summary).is_err());
    }

    #[test]
    fn truncated_bytes_fail_decoding() -> Result<()> {
        let registry = registry();
        let bytes = canonical_encode(&registry, &subject(&["pizza"], 1))?;
        assert!(canonical_decode(&registry, &bytes[..bytes.len() - 3]).is_err());
        Ok(())
    }

    #[test]
    fn absent_and_present_optionals_encode_distinctly() -> Result<()> {
        let registry = registry();
        let bare = ObjectData::new(recipes::ANALYSIS_CURSOR).with("topicId", text("t1"));
        let pointed = bare
            .clone()
            .with(
                "lastAnalyzedEntry",
                Value::Reference(crate::ContentHash::of(b"entry")),
            );
        assert_ne!(
            content_hash(&registry, &bare)?,
            content_hash(&registry, &pointed)?
        );
        // Absence is part of identity only for id-marked optionals; the
        // cursor pointer is not identity-forming.
        assert_eq!(id_hash(&registry, &bare)?, id_hash(&registry, &pointed)?);
        Ok(())
    }
}
