/*!
 * Lookup Tables
 *
 * The core record interface `(key, values...)` with three built-in
 * backends: `file` scans a text file linearly, `hash` adds an in-memory
 * hash over the parsed rows, `regex` replaces the key type with compiled
 * patterns. Everything else (databases, directories, network tables)
 * registers a constructor by name from the outside.
 *
 * Table specifications look like `type:/path{args}`; a bare path means
 * `file`. File format: one record per line, `key: v1, v2, ...` or a bare
 * `key`; `#` starts a comment; quoting follows the command tokenizer.
 */

use ahash::RandomState;
use dashmap::DashMap;
use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::sync::Arc;

use log::debug;

use crate::containers::Key;
use crate::core::errors::LookupError;
use crate::core::tokenizer::strip_comment;
use crate::core::types::LookupResult;

/// An open table; `search` returns the values of the first matching row.
pub trait LookupTable: Send + Sync {
    fn search(&self, key: &str) -> Option<Vec<String>>;
}

type Constructor =
    Arc<dyn Fn(&str, Option<&str>) -> LookupResult<Box<dyn LookupTable>> + Send + Sync>;

/// Name-indexed backend constructors. The three core backends are
/// pre-registered; modules add their own.
pub struct LookupTables {
    backends: DashMap<String, Constructor, RandomState>,
}

impl Default for LookupTables {
    fn default() -> Self {
        Self::new()
    }
}

impl LookupTables {
    #[must_use]
    pub fn new() -> Self {
        let tables = Self {
            backends: DashMap::with_hasher(RandomState::new()),
        };
        tables.register("file", |path, _| {
            Ok(Box::new(FileTable::open(path, KeyKind::Str)?) as Box<dyn LookupTable>)
        });
        tables.register("regex", |path, _| {
            Ok(Box::new(FileTable::open(path, KeyKind::Regex)?) as Box<dyn LookupTable>)
        });
        tables.register("hash", |path, _| {
            Ok(Box::new(HashTable::open(path)?) as Box<dyn LookupTable>)
        });
        tables
    }

    pub fn register<F>(&self, name: &str, constructor: F)
    where
        F: Fn(&str, Option<&str>) -> LookupResult<Box<dyn LookupTable>> + Send + Sync + 'static,
    {
        self.backends
            .insert(name.to_string(), Arc::new(constructor));
    }

    /// Open `type:path{args}`; a bare path is a plain `file` table.
    pub fn open(&self, spec: &str) -> LookupResult<Box<dyn LookupTable>> {
        let (ttype, rest) = match spec.split_once(':') {
            Some((t, rest)) => (t, rest),
            None => ("file", spec),
        };
        let (path, args) = match rest.split_once('{') {
            Some((p, a)) => (p, Some(a.trim_end_matches('}'))),
            None => (rest, None),
        };
        if path.is_empty() {
            return Err(LookupError::BadSpec(spec.to_string()));
        }
        let constructor = self
            .backends
            .get(ttype)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| LookupError::UnknownBackend(ttype.to_string()))?;
        debug!("opening {} lookup table at {:?}", ttype, path);
        constructor(path, args)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Str,
    Int,
    Ip,
    Regex,
}

fn build_key(kind: KeyKind, raw: &str, path: &str, line: usize) -> LookupResult<Key> {
    match kind {
        KeyKind::Str => Ok(Key::Str(raw.to_string())),
        KeyKind::Int => raw
            .parse::<i64>()
            .map(Key::Int)
            .map_err(|_| LookupError::Parse {
                path: path.to_string(),
                line,
                reason: format!("bad integer key {:?}", raw),
            }),
        KeyKind::Ip => raw.parse().map(Key::Ip).map_err(|e| match e {
            LookupError::Parse { reason, .. } => LookupError::Parse {
                path: path.to_string(),
                line,
                reason,
            },
            other => other,
        }),
        KeyKind::Regex => Key::regex(raw),
    }
}

/// Split one non-empty record line into key and values.
fn parse_row(line: &str) -> (String, Vec<String>) {
    match line.split_once(':') {
        Some((key, values)) => (
            key.trim().to_string(),
            values
                .split(',')
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .collect(),
        ),
        None => (line.trim().to_string(), Vec::new()),
    }
}

fn read_rows(path: &str) -> LookupResult<Vec<(usize, String, Vec<String>)>> {
    let file = std::fs::File::open(path).map_err(|e| LookupError::Open {
        path: path.to_string(),
        source: e,
    })?;
    let mut rows = Vec::new();
    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| LookupError::Open {
            path: path.to_string(),
            source: e,
        })?;
        let line = strip_comment(&line);
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (key, values) = parse_row(line);
        rows.push((lineno + 1, key, values));
    }
    Ok(rows)
}

/// Linear-scan text table; the key type decides the match semantics.
pub struct FileTable {
    rows: Vec<(Key, Vec<String>)>,
}

impl FileTable {
    pub fn open(path: &str, kind: KeyKind) -> LookupResult<Self> {
        let mut rows = Vec::new();
        for (lineno, raw_key, values) in read_rows(path)? {
            rows.push((build_key(kind, &raw_key, path, lineno)?, values));
        }
        debug!("loaded {} rows from {:?}", rows.len(), path);
        Ok(Self { rows })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl LookupTable for FileTable {
    fn search(&self, key: &str) -> Option<Vec<String>> {
        self.rows
            .iter()
            .find(|(k, _)| k.matches(key))
            .map(|(_, v)| v.clone())
    }
}

/// Round a wanted size up to the next `2^k - 1`, the bucket counts the
/// hash layer sizes itself with.
#[must_use]
pub fn next_hash_size(wanted: usize) -> usize {
    let mut size = 63usize;
    while size < wanted && size < 0x00FF_FFFF {
        size = ((size + 1) << 1) - 1;
    }
    size
}

/// Text table with an in-memory hash over the parsed rows; exact string
/// keys only.
pub struct HashTable {
    index: HashMap<String, Vec<String>, RandomState>,
}

impl HashTable {
    pub fn open(path: &str) -> LookupResult<Self> {
        let rows = read_rows(path)?;
        let mut index = HashMap::with_capacity_and_hasher(
            next_hash_size(rows.len()),
            RandomState::new(),
        );
        for (_, key, values) in rows {
            // First occurrence wins, like the linear scan would.
            index.entry(key).or_insert(values);
        }
        Ok(Self { index })
    }
}

impl LookupTable for HashTable {
    fn search(&self, key: &str) -> Option<Vec<String>> {
        self.index.get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    fn table_file(content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f.flush().unwrap();
        f
    }

    const SAMPLE: &str = "\
# comment line
alpha: one, two
beta: three
bare_key
gamma: four # trailing comment
";

    #[test]
    fn file_table_search() {
        let f = table_file(SAMPLE);
        let tables = LookupTables::new();
        let t = tables.open(f.path().to_str().unwrap()).unwrap();
        assert_eq!(t.search("alpha"), Some(vec!["one".into(), "two".into()]));
        assert_eq!(t.search("bare_key"), Some(vec![]));
        assert_eq!(t.search("gamma"), Some(vec!["four".into()]));
        assert_eq!(t.search("missing"), None);
    }

    #[test]
    fn hash_table_matches_file_semantics() {
        let f = table_file(SAMPLE);
        let tables = LookupTables::new();
        let spec = format!("hash:{}", f.path().display());
        let t = tables.open(&spec).unwrap();
        assert_eq!(t.search("beta"), Some(vec!["three".into()]));
        assert_eq!(t.search("nope"), None);
    }

    #[test]
    fn regex_table_matches_patterns() {
        let f = table_file("^image/.*$: scan\n^text/html$: rewrite\n");
        let tables = LookupTables::new();
        let spec = format!("regex:{}", f.path().display());
        let t = tables.open(&spec).unwrap();
        assert_eq!(t.search("image/png"), Some(vec!["scan".into()]));
        assert_eq!(t.search("text/html"), Some(vec!["rewrite".into()]));
        assert_eq!(t.search("application/json"), None);
    }

    #[test]
    fn unknown_backend_is_an_error() {
        let tables = LookupTables::new();
        assert!(matches!(
            tables.open("bdb:/nonexistent"),
            Err(LookupError::UnknownBackend(_))
        ));
    }

    #[test]
    fn registered_backend_is_found() {
        struct Fixed;
        impl LookupTable for Fixed {
            fn search(&self, _key: &str) -> Option<Vec<String>> {
                Some(vec!["fixed".into()])
            }
        }
        let tables = LookupTables::new();
        tables.register("fixed", |_, _| Ok(Box::new(Fixed)));
        let t = tables.open("fixed:whatever").unwrap();
        assert_eq!(t.search("anything"), Some(vec!["fixed".into()]));
    }

    #[test]
    fn hash_size_rounding() {
        assert_eq!(next_hash_size(10), 63);
        assert_eq!(next_hash_size(63), 63);
        assert_eq!(next_hash_size(64), 127);
        assert_eq!(next_hash_size(1000), 1023);
    }

    #[test]
    fn missing_file_reports_the_path() {
        let tables = LookupTables::new();
        match tables.open("/definitely/not/here.txt") {
            Err(LookupError::Open { path, .. }) => assert_eq!(path, "/definitely/not/here.txt"),
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }
}
