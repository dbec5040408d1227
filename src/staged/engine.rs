//! Generic staged-apply skeleton (§4.7 step 2-4): read staged file, treat
//! an empty-after-trim body as "remove the target", validate, then either
//! write atomically into place or hand off to an API-call applier.

use super::StagedContext;
use crate::capability::{Fs, Runner};
use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub enum StagedFile {
    /// Not present in the staging tree at all; the engine takes no action.
    Missing,
    /// Present but empty after trimming whitespace — treat as "remove the
    /// live file" to avoid feeding an empty body to the target daemon's
    /// parser.
    Remove,
    Present(String),
}

/// Read `<stage_root>/<rel_path>`, classifying it per the rules above.
pub fn read_staged(ctx: &StagedContext, rel_path: &str) -> Result<StagedFile> {
    let path = ctx.stage_path(rel_path);
    if !ctx.caps.fs.exists(&path) {
        return Ok(StagedFile::Missing);
    }
    let raw = ctx
        .caps
        .fs
        .read_to_string(&path)
        .with_context(|| format!("read staged {}", path.display()))?;
    if raw.trim().is_empty() {
        Ok(StagedFile::Remove)
    } else {
        Ok(StagedFile::Present(raw))
    }
}

/// Install validated `contents` atomically at `<dest_root>/<rel_path>`, or
/// remove the live file when `contents` is `None` (the "Remove" case).
pub fn install_or_remove(ctx: &StagedContext, rel_path: &str, contents: Option<&str>, mode: u32) -> Result<()> {
    let dest = ctx.dest_path(rel_path);
    match contents {
        Some(body) => ctx
            .caps
            .fs
            .write_atomic(&dest, body.as_bytes(), mode)
            .with_context(|| format!("install {}", dest.display())),
        None => ctx
            .caps
            .fs
            .remove_file(&dest)
            .with_context(|| format!("remove {}", dest.display())),
    }
}

/// Validator: the staged content must contain at least one `[section]`
/// header line, the shape every PVE/PBS section-style config shares.
pub fn has_section_header(body: &str) -> bool {
    body.lines()
        .any(|l| l.trim_start().starts_with('[') && l.trim_end().ends_with(']'))
}

pub fn list_current_ids(ctx: &StagedContext, list_cmd: &crate::capability::process::CmdSpec) -> Result<Vec<String>> {
    use crate::capability::process::Pipeline;
    let out = ctx
        .caps
        .runner
        .run_capture(&Pipeline::single(list_cmd.clone()))
        .unwrap_or_default();
    let parsed: Vec<serde_json::Value> = serde_json::from_str(&out).unwrap_or_default();
    Ok(parsed
        .iter()
        .filter_map(|v| v.get("id").or_else(|| v.get("name")))
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::test_support::{FakeRunner, fake_caps};
    use std::path::Path;

    #[test]
    fn read_staged_classifies_missing_empty_present() {
        let tmp = tempfile::tempdir().unwrap();
        let caps = fake_caps(FakeRunner::new());
        let ctx = StagedContext::new(&caps, tmp.path(), Path::new("/"), false);

        assert!(matches!(read_staged(&ctx, "etc/x.cfg").unwrap(), StagedFile::Missing));

        std::fs::write(tmp.path().join("empty.cfg"), "   \n").unwrap();
        assert!(matches!(read_staged(&ctx, "empty.cfg").unwrap(), StagedFile::Remove));

        std::fs::write(tmp.path().join("full.cfg"), "datastore: x\n").unwrap();
        match read_staged(&ctx, "full.cfg").unwrap() {
            StagedFile::Present(body) => assert_eq!(body, "datastore: x\n"),
            other => panic!("expected Present, got {other:?}"),
        }
    }

    #[test]
    fn section_header_detection() {
        assert!(has_section_header("[remote: x]\nserver 1.2.3.4\n"));
        assert!(!has_section_header("server 1.2.3.4\n"));
    }
}
