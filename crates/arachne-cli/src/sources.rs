//! The source list file: a JSON array of packages to load at startup.
//!
//! Entries are either full package specs or the compact form
//! `{"key": "...", "source": "<uri>;sha256;<checksum>"}`. Relative paths
//! resolve against the directory of the list file.

use std::path::Path;

use anyhow::{Context, Result, bail};
use arachne_core::plugin::PackageSpec;
use serde::Deserialize;
use url::Url;

#[derive(Deserialize)]
#[serde(untagged)]
enum SourceEntry {
    Compact {
        key: String,
        source: String,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        config: serde_json::Value,
        #[serde(default)]
        searchable: Option<bool>,
        #[serde(default)]
        quick_search: Option<bool>,
    },
    Spec(PackageSpec),
}

impl SourceEntry {
    fn into_spec(self) -> Result<PackageSpec> {
        match self {
            SourceEntry::Spec(spec) => Ok(spec),
            SourceEntry::Compact {
                key,
                source,
                name,
                config,
                searchable,
                quick_search,
            } => {
                let mut spec = PackageSpec::parse(key.as_str(), &source)
                    .with_context(|| format!("Bad source for '{key}'"))?;
                spec.name = name;
                spec.config = config;
                spec.searchable = searchable;
                spec.quick_search = quick_search;
                Ok(spec)
            }
        }
    }
}

pub fn parse_sources(json: &str, base_dir: &Path) -> Result<Vec<PackageSpec>> {
    let entries: Vec<SourceEntry> =
        serde_json::from_str(json).context("Source list must be a JSON array of packages")?;

    let mut specs = Vec::with_capacity(entries.len());
    for entry in entries {
        let mut spec = entry.into_spec()?;
        if spec.key.trim().is_empty() {
            bail!("Source entry with uri '{}' has an empty key", spec.uri);
        }
        if Url::parse(&spec.uri).is_err() && Path::new(&spec.uri).is_relative() {
            spec.uri = base_dir.join(&spec.uri).to_string_lossy().into_owned();
        }
        specs.push(spec);
    }
    Ok(specs)
}

pub fn read_sources(path: &Path) -> Result<Vec<PackageSpec>> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read source list: {}", path.display()))?;
    let base_dir = path.parent().unwrap_or(Path::new("."));
    parse_sources(&json, base_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arachne_core::plugin::ChecksumRef;

    const HEX: &str = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

    #[test]
    fn test_parses_both_entry_forms() {
        let json = format!(
            r#"[
                {{"key": "a", "uri": "https://packs.example/a.json", "searchable": false}},
                {{"key": "b", "source": "https://packs.example/b.json;sha256;{HEX}",
                  "config": {{"site": "https://mirror.example"}}}}
            ]"#
        );
        let specs = parse_sources(&json, Path::new("/etc/arachne")).unwrap();

        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].searchable, Some(false));
        assert_eq!(specs[1].checksum, Some(ChecksumRef::Inline(HEX.to_string())));
        assert_eq!(specs[1].config["site"], "https://mirror.example");
    }

    #[test]
    fn test_relative_paths_resolve_against_list_dir() {
        let json = r#"[{"key": "a", "uri": "packs/a.json"}, {"key": "b", "uri": "/abs/b.json"}]"#;
        let specs = parse_sources(json, Path::new("/etc/arachne")).unwrap();
        assert_eq!(
            Path::new(&specs[0].uri),
            Path::new("/etc/arachne/packs/a.json")
        );
        assert_eq!(specs[1].uri, "/abs/b.json");
    }

    #[test]
    fn test_rejects_bad_entries() {
        assert!(parse_sources(r#"{"key": "a"}"#, Path::new(".")).is_err());
        assert!(parse_sources(r#"[{"key": "a", "source": "x.json;md5;abc"}]"#, Path::new(".")).is_err());
        assert!(parse_sources(r#"[{"key": " ", "uri": "x.json"}]"#, Path::new(".")).is_err());
    }

    #[test]
    fn test_read_sources_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sources.json");
        std::fs::write(&path, r#"[{"key": "a", "uri": "a.json"}]"#).unwrap();

        let specs = read_sources(&path).unwrap();
        assert_eq!(Path::new(&specs[0].uri), dir.path().join("a.json"));
    }
}
