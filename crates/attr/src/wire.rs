use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bag::{AttributeBag, AttributePresence, AttributeRef};
use crate::dictionary::GlobalWords;
use crate::errors::AttrError;
use crate::value::AttributeValue;

/// Compressed attribute message. Non-negative indices resolve against the
/// process global word list, negative indices against this message's own
/// `words` via `idx = -i - 1`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WireAttributes {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub words: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub strings: BTreeMap<i32, i32>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub int64s: BTreeMap<i32, i64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub doubles: BTreeMap<i32, f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub bools: BTreeMap<i32, bool>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub timestamps: BTreeMap<i32, DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub durations: BTreeMap<i32, Duration>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub string_maps: BTreeMap<i32, BTreeMap<i32, i32>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub bytes: BTreeMap<i32, Vec<u8>>,
}

impl WireAttributes {
    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
            && self.int64s.is_empty()
            && self.doubles.is_empty()
            && self.bools.is_empty()
            && self.timestamps.is_empty()
            && self.durations.is_empty()
            && self.string_maps.is_empty()
            && self.bytes.is_empty()
    }
}

/// Referenced-attribute export for responses; a runtime side channel, never
/// part of the attribute maps themselves.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReferencedAttributes {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub words: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attribute_matches: Vec<ReferencedMatch>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReferencedMatch {
    pub name: i32,
    pub condition: AttributePresence,
}

/// Assigns wire indices, spilling words beyond the advertised global prefix
/// into the per-message delta list.
struct WordIndexer<'a> {
    global: &'a GlobalWords,
    global_word_count: usize,
    delta: Vec<String>,
    delta_index: HashMap<String, i32>,
}

impl<'a> WordIndexer<'a> {
    fn new(global: &'a GlobalWords, global_word_count: usize) -> Self {
        Self {
            global,
            global_word_count: global_word_count.min(global.len()),
            delta: Vec::new(),
            delta_index: HashMap::new(),
        }
    }

    fn intern(&mut self, word: &str) -> i32 {
        if let Some(idx) = self.global.index_of(word) {
            if (idx as usize) < self.global_word_count {
                return idx;
            }
        }
        if let Some(idx) = self.delta_index.get(word) {
            return *idx;
        }
        let idx = -(self.delta.len() as i32) - 1;
        self.delta.push(word.to_string());
        self.delta_index.insert(word.to_string(), idx);
        idx
    }
}

fn resolve<'a>(
    index: i32,
    global: &'a GlobalWords,
    delta: &'a [String],
) -> Result<&'a str, AttrError> {
    if index >= 0 {
        global.word_at(index).ok_or(AttrError::UnknownWord {
            index,
            known: global.len(),
        })
    } else {
        let slot = (-index - 1) as usize;
        delta
            .get(slot)
            .map(String::as_str)
            .ok_or_else(|| AttrError::MalformedWire(format!("delta index {index} out of range")))
    }
}

/// Encodes a bag's flattened contents. Words outside the first
/// `global_word_count` global entries travel in the message's delta list.
pub fn encode_bag(
    bag: &AttributeBag,
    global: &GlobalWords,
    global_word_count: usize,
) -> WireAttributes {
    let mut entries: Vec<(String, AttributeValue)> = bag.flatten().into_iter().collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let mut indexer = WordIndexer::new(global, global_word_count);
    let mut wire = WireAttributes::default();
    for (name, value) in entries {
        let key = indexer.intern(&name);
        match value {
            AttributeValue::String(s) => {
                let v = indexer.intern(&s);
                wire.strings.insert(key, v);
            }
            AttributeValue::Int64(v) => {
                wire.int64s.insert(key, v);
            }
            AttributeValue::Double(v) => {
                wire.doubles.insert(key, v);
            }
            AttributeValue::Bool(v) => {
                wire.bools.insert(key, v);
            }
            AttributeValue::Timestamp(v) => {
                wire.timestamps.insert(key, v);
            }
            AttributeValue::Duration(v) => {
                wire.durations.insert(key, v);
            }
            AttributeValue::StringMap(map) => {
                let mut encoded = BTreeMap::new();
                for (k, v) in map {
                    let ki = indexer.intern(&k);
                    let vi = indexer.intern(&v);
                    encoded.insert(ki, vi);
                }
                wire.string_maps.insert(key, encoded);
            }
            AttributeValue::IpAddress(b) | AttributeValue::Bytes(b) => {
                wire.bytes.insert(key, b);
            }
        }
    }
    wire.words = indexer.delta;
    wire
}

/// Decodes a wire message into a read-only root bag. Fails on out-of-range
/// indices and on a key appearing in more than one value map.
pub fn decode_bag(wire: &WireAttributes, global: &GlobalWords) -> Result<AttributeBag, AttrError> {
    let values = decode_values(wire, global)?;
    Ok(AttributeBag::from_wire_values(values))
}

fn decode_values(
    wire: &WireAttributes,
    global: &GlobalWords,
) -> Result<HashMap<String, AttributeValue>, AttrError> {
    let mut values: HashMap<String, AttributeValue> = HashMap::new();
    let mut insert = |name: String, value: AttributeValue| -> Result<(), AttrError> {
        if values.insert(name.clone(), value).is_some() {
            return Err(AttrError::MalformedWire(format!(
                "attribute '{name}' appears more than once"
            )));
        }
        Ok(())
    };

    for (key, value) in &wire.strings {
        let name = resolve(*key, global, &wire.words)?.to_string();
        let word = resolve(*value, global, &wire.words)?.to_string();
        insert(name, AttributeValue::String(word))?;
    }
    for (key, value) in &wire.int64s {
        let name = resolve(*key, global, &wire.words)?.to_string();
        insert(name, AttributeValue::Int64(*value))?;
    }
    for (key, value) in &wire.doubles {
        let name = resolve(*key, global, &wire.words)?.to_string();
        insert(name, AttributeValue::Double(*value))?;
    }
    for (key, value) in &wire.bools {
        let name = resolve(*key, global, &wire.words)?.to_string();
        insert(name, AttributeValue::Bool(*value))?;
    }
    for (key, value) in &wire.timestamps {
        let name = resolve(*key, global, &wire.words)?.to_string();
        insert(name, AttributeValue::Timestamp(*value))?;
    }
    for (key, value) in &wire.durations {
        let name = resolve(*key, global, &wire.words)?.to_string();
        insert(name, AttributeValue::Duration(*value))?;
    }
    for (key, map) in &wire.string_maps {
        let name = resolve(*key, global, &wire.words)?.to_string();
        let mut decoded = BTreeMap::new();
        for (k, v) in map {
            let kw = resolve(*k, global, &wire.words)?.to_string();
            let vw = resolve(*v, global, &wire.words)?.to_string();
            if decoded.insert(kw, vw).is_some() {
                return Err(AttrError::MalformedWire(format!(
                    "string map '{name}' has duplicate keys"
                )));
            }
        }
        insert(name, AttributeValue::StringMap(decoded))?;
    }
    for (key, value) in &wire.bytes {
        let name = resolve(*key, global, &wire.words)?.to_string();
        insert(name, AttributeValue::Bytes(value.clone()))?;
    }
    Ok(values)
}

/// Applies a follow-up wire block over an existing bag (batched reports send
/// deltas after the first block).
pub fn update_bag_from_wire(
    bag: &mut AttributeBag,
    wire: &WireAttributes,
    global: &GlobalWords,
) -> Result<(), AttrError> {
    let values = decode_values(wire, global)?;
    let mut entries: Vec<(String, AttributeValue)> = values.into_iter().collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    for (name, value) in entries {
        bag.set(name, value)?;
    }
    Ok(())
}

/// Encodes only the attributes of `curr` that are new or changed relative to
/// `prev`. Used when batching report blocks.
pub fn delta_bag(
    prev: &AttributeBag,
    curr: &AttributeBag,
    global: &GlobalWords,
    global_word_count: usize,
) -> WireAttributes {
    let mut changed = AttributeBag::new();
    let mut entries: Vec<(String, AttributeValue)> = curr.flatten().into_iter().collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    for (name, value) in entries {
        let unchanged = prev
            .lookup(&name)
            .map(|old| old.wire_eq(&value))
            .unwrap_or(false);
        if !unchanged {
            // set on a fresh mutable bag cannot fail
            let _ = changed.set(name, value);
        }
    }
    encode_bag(&changed, global, global_word_count)
}

/// Exports a referenced-attributes snapshot using the same two-tier indexing
/// as the attribute maps.
pub fn referenced_to_wire(
    refs: &[AttributeRef],
    global: &GlobalWords,
    global_word_count: usize,
) -> ReferencedAttributes {
    let mut indexer = WordIndexer::new(global, global_word_count);
    let mut matches = Vec::with_capacity(refs.len());
    for reference in refs {
        let name = indexer.intern(&reference.name);
        matches.push(ReferencedMatch {
            name,
            condition: reference.presence,
        });
    }
    ReferencedAttributes {
        words: indexer.delta,
        attribute_matches: matches,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_bag() -> AttributeBag {
        let mut bag = AttributeBag::new();
        bag.set("source.ip", AttributeValue::Bytes(vec![10, 0, 0, 1])).unwrap();
        bag.set("source.name", AttributeValue::from("svc-a")).unwrap();
        bag.set("request.size", AttributeValue::from(1024i64)).unwrap();
        bag.set("request.time", AttributeValue::Timestamp(
            Utc.with_ymd_and_hms(2017, 1, 1, 0, 0, 0).unwrap(),
        ))
        .unwrap();
        bag.set("request.duration", AttributeValue::Duration(Duration::from_secs(10)))
            .unwrap();
        bag.set("response.code", AttributeValue::from(200i64)).unwrap();
        bag.set("custom.flag", AttributeValue::from(true)).unwrap();
        bag.set("custom.ratio", AttributeValue::from(0.25f64)).unwrap();
        let mut headers = BTreeMap::new();
        headers.insert("clnt".to_string(), "abc".to_string());
        headers.insert("host".to_string(), "svc.local".to_string());
        bag.set("request.headers", AttributeValue::StringMap(headers)).unwrap();
        bag
    }

    #[test]
    fn encode_decode_round_trips() {
        let global = GlobalWords::standard();
        let bag = sample_bag();

        let wire = encode_bag(&bag, &global, global.len());
        let decoded = decode_bag(&wire, &global).unwrap();

        let original = bag.flatten();
        let recovered = decoded.flatten();
        assert_eq!(original.len(), recovered.len());
        for (name, value) in &original {
            let got = recovered.get(name).unwrap_or_else(|| panic!("missing {name}"));
            assert!(value.wire_eq(got), "{name}: {value:?} != {got:?}");
        }
    }

    #[test]
    fn custom_words_land_in_delta_list() {
        let global = GlobalWords::standard();
        let mut bag = AttributeBag::new();
        bag.set("custom.attribute", AttributeValue::from("x")).unwrap();

        let wire = encode_bag(&bag, &global, global.len());
        assert!(wire.words.contains(&"custom.attribute".to_string()));
        assert!(wire.strings.keys().all(|k| *k < 0));
    }

    #[test]
    fn short_global_prefix_spills_known_words() {
        let global = GlobalWords::standard();
        let mut bag = AttributeBag::new();
        bag.set("request.headers", AttributeValue::StringMap(BTreeMap::new())).unwrap();

        // advertise a prefix too short to include request.headers
        let wire = encode_bag(&bag, &global, 1);
        assert_eq!(wire.words, vec!["request.headers".to_string()]);
    }

    #[test]
    fn unknown_global_index_fails() {
        let global = GlobalWords::from_words(["only.word"]);
        let mut wire = WireAttributes::default();
        wire.int64s.insert(7, 1);

        let err = decode_bag(&wire, &global).unwrap_err();
        assert!(matches!(err, AttrError::UnknownWord { index: 7, .. }));
    }

    #[test]
    fn out_of_range_delta_index_fails() {
        let global = GlobalWords::from_words(["only.word"]);
        let mut wire = WireAttributes::default();
        wire.int64s.insert(-2, 1);

        let err = decode_bag(&wire, &global).unwrap_err();
        assert!(matches!(err, AttrError::MalformedWire(_)));
    }

    #[test]
    fn duplicate_key_across_maps_fails() {
        let global = GlobalWords::from_words(["attr"]);
        let mut wire = WireAttributes::default();
        wire.int64s.insert(0, 1);
        wire.bools.insert(0, true);

        let err = decode_bag(&wire, &global).unwrap_err();
        assert!(matches!(err, AttrError::MalformedWire(_)));
    }

    #[test]
    fn delta_omits_unchanged_keys() {
        let global = GlobalWords::standard();
        let mut prev = AttributeBag::new();
        prev.set("response.code", AttributeValue::from(200i64)).unwrap();
        prev.set("source.name", AttributeValue::from("svc-a")).unwrap();

        let mut curr = AttributeBag::new();
        curr.set("response.code", AttributeValue::from(500i64)).unwrap();
        curr.set("source.name", AttributeValue::from("svc-a")).unwrap();

        let wire = delta_bag(&prev, &curr, &global, global.len());
        let decoded = decode_bag(&wire, &global).unwrap();
        assert_eq!(
            decoded.flatten().keys().collect::<Vec<_>>(),
            vec!["response.code"]
        );
    }

    #[test]
    fn update_applies_wire_over_existing_bag() {
        let global = GlobalWords::standard();
        let mut bag = AttributeBag::new();
        bag.set("response.code", AttributeValue::from(200i64)).unwrap();

        let mut delta = AttributeBag::new();
        delta.set("response.code", AttributeValue::from(404i64)).unwrap();
        let wire = encode_bag(&delta, &global, global.len());

        update_bag_from_wire(&mut bag, &wire, &global).unwrap();
        assert_eq!(bag.get("response.code"), Some(AttributeValue::from(404i64)));
    }

    #[test]
    fn referenced_export_uses_word_indices() {
        let global = GlobalWords::standard();
        let refs = vec![
            AttributeRef {
                name: "source.ip".into(),
                presence: AttributePresence::Present,
            },
            AttributeRef {
                name: "custom.missing".into(),
                presence: AttributePresence::Absent,
            },
        ];

        let exported = referenced_to_wire(&refs, &global, global.len());
        assert_eq!(exported.attribute_matches[0].name, 0);
        assert_eq!(exported.attribute_matches[1].name, -1);
        assert_eq!(exported.words, vec!["custom.missing".to_string()]);
    }
}
