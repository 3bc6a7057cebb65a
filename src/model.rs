use std::collections::{HashMap, HashSet};
use std::fmt;
use std::marker::PhantomData;

use serde::de::{self, MapAccess, SeqAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Query id -> document ids that must never be ranked for that query.
pub type ExcludedIds = HashMap<String, Vec<String>>;

/// Query id -> gold document ids, used for hit diagnostics.
pub type GoldSets = HashMap<String, HashSet<String>>;

/// Query id -> {document id: relevance grade}.
pub type Qrels = HashMap<String, HashMap<String, i64>>;

/// Document id -> score, best first.
pub type Ranking = OrderedMap<f64>;

/// Query id -> ranking, in query order.
pub type RankedResult = OrderedMap<Ranking>;

/// Metric name -> averaged value, in report order.
pub type MetricReport = OrderedMap<f64>;

/// String-keyed map that keeps insertion order, including through JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderedMap<V> {
    entries: Vec<(String, V)>,
}

impl<V> Default for OrderedMap<V> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<V> OrderedMap<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Builds a map where a repeated key overwrites the value but keeps its first position.
    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (String, V)>,
    {
        let mut positions = HashMap::<String, usize>::new();
        let mut out = Vec::<(String, V)>::new();
        for (key, value) in entries {
            match positions.get(&key) {
                Some(&index) => out[index].1 = value,
                None => {
                    positions.insert(key.clone(), out.len());
                    out.push((key, value));
                }
            }
        }
        Self { entries: out }
    }

    /// Appends without a duplicate check; callers guarantee the key is new.
    pub fn push(&mut self, key: String, value: V) {
        self.entries.push((key, value));
    }

    pub fn get(&self, key: &str) -> Option<&V> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, value)| value)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(key, _)| key.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.entries.iter().map(|(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &V)> {
        self.entries.iter().map(|(key, value)| (key.as_str(), value))
    }

    pub fn map_values<U>(&self, mut f: impl FnMut(&str, &V) -> U) -> OrderedMap<U> {
        OrderedMap {
            entries: self
                .entries
                .iter()
                .map(|(key, value)| (key.clone(), f(key, value)))
                .collect(),
        }
    }
}

impl<V> IntoIterator for OrderedMap<V> {
    type Item = (String, V);
    type IntoIter = std::vec::IntoIter<(String, V)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<V> FromIterator<(String, V)> for OrderedMap<V> {
    fn from_iter<I: IntoIterator<Item = (String, V)>>(iter: I) -> Self {
        Self::from_entries(iter)
    }
}

impl<V: Serialize> Serialize for OrderedMap<V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, value) in &self.entries {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

impl<'de, V: Deserialize<'de>> Deserialize<'de> for OrderedMap<V> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OrderedMapVisitor<V>(PhantomData<V>);

        impl<'de, V: Deserialize<'de>> Visitor<'de> for OrderedMapVisitor<V> {
            type Value = OrderedMap<V>;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a string-keyed map")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let capacity = access.size_hint().unwrap_or(0);
                let mut entries = Vec::<(String, V)>::with_capacity(capacity);
                while let Some((key, value)) = access.next_entry::<String, V>()? {
                    entries.push((key, value));
                }
                Ok(OrderedMap::from_entries(entries))
            }
        }

        deserializer.deserialize_map(OrderedMapVisitor(PhantomData))
    }
}

/// Dense `queries x documents` similarity matrix, rows in query order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScoreMatrix {
    rows: Vec<Vec<f64>>,
}

impl ScoreMatrix {
    pub fn from_rows(rows: Vec<Vec<f64>>) -> Self {
        Self { rows }
    }

    pub fn rows(&self) -> &[Vec<f64>] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Vec<f64>> {
        self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// Accepts identifiers written either as JSON strings or as JSON integers.
pub fn deserialize_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    deserializer.deserialize_any(IdVisitor)
}

pub fn deserialize_id_list<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Vec<String>, D::Error> {
    struct IdListVisitor;

    impl<'de> Visitor<'de> for IdListVisitor {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a list of string or integer identifiers")
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
            let mut out = Vec::<String>::with_capacity(seq.size_hint().unwrap_or(0));
            while let Some(IdString(value)) = seq.next_element::<IdString>()? {
                out.push(value);
            }
            Ok(out)
        }
    }

    deserializer.deserialize_seq(IdListVisitor)
}

struct IdString(String);

impl<'de> Deserialize<'de> for IdString {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserialize_id(deserializer).map(IdString)
    }
}

struct IdVisitor;

impl Visitor<'_> for IdVisitor {
    type Value = String;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a string or integer identifier")
    }

    fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
        Ok(value.to_string())
    }

    fn visit_string<E: de::Error>(self, value: String) -> Result<Self::Value, E> {
        Ok(value)
    }

    fn visit_u64<E: de::Error>(self, value: u64) -> Result<Self::Value, E> {
        Ok(value.to_string())
    }

    fn visit_i64<E: de::Error>(self, value: i64) -> Result<Self::Value, E> {
        Ok(value.to_string())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrievalSettings {
    pub embed_method: String,
    pub desc_weight: f64,
    pub fusion_method: String,
    pub k_values: Vec<usize>,
    pub batch_size: usize,
    pub flush_every: usize,
    pub dimensions: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrievalCounts {
    pub query_count: usize,
    pub document_count: usize,
    pub evaluated_query_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrievalRunManifest {
    pub manifest_version: u32,
    pub run_id: String,
    pub task: String,
    pub backend: String,
    pub fusion_desc: bool,
    pub long_context: bool,
    pub status: String,
    pub started_at: String,
    pub updated_at: String,
    pub duration_ms: u128,
    pub score_reused: bool,
    pub settings: RetrievalSettings,
    pub counts: RetrievalCounts,
    pub outputs: Vec<String>,
    pub warnings: Vec<String>,
}
