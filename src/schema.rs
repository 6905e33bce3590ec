use std::{fs, path::Path};

use anyhow::{Context as _, Result};
use extension_sdk::{
    envelope::Envelope,
    message::{LoadParams, RenderCommit, SessionInfo},
};
use schemars::{schema_for, JsonSchema};
use tracing::info;

/// Writes the JSON schemas of the wire records into `out_dir`.
pub fn write_schema(out_dir: &Path) -> Result<Vec<String>> {
    fs::create_dir_all(out_dir).with_context(|| format!("creating {}", out_dir.display()))?;

    let written = vec![
        write_one::<Envelope>(out_dir, "envelope")?,
        write_one::<LoadParams>(out_dir, "load-params")?,
        write_one::<RenderCommit>(out_dir, "render-commit")?,
        write_one::<SessionInfo>(out_dir, "session-info")?,
    ];
    info!(dir = %out_dir.display(), count = written.len(), "schemas written");
    Ok(written)
}

fn write_one<T: JsonSchema>(out_dir: &Path, name: &str) -> Result<String> {
    let schema = schema_for!(T);
    let json = serde_json::to_string_pretty(&schema)?;
    let filename = format!("{name}.schema.json");
    fs::write(out_dir.join(&filename), json).with_context(|| format!("writing {filename}"))?;
    Ok(filename)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tempfile::tempdir;

    #[test]
    fn writes_one_file_per_record() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("schemas");
        let files = write_schema(&out).unwrap();
        assert_eq!(files.len(), 4);

        let raw = fs::read_to_string(out.join("render-commit.schema.json")).unwrap();
        let schema: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(schema["title"], "RenderCommit");
        assert!(out.join("envelope.schema.json").is_file());
    }
}
