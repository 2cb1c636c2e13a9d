//! The script engine: frame management, step dispatch, and the JSON
//! document store. Scripts arrive as JSON files or as the `module.exports`
//! dialect the desktop runtime accepted; anything richer than a JSON
//! object literal in the latter fails `script-parse`.

pub mod exec;
pub mod frame;
pub mod jsonops;

pub use exec::{EngineServices, HostHooks, ScriptEngine, ScriptRun};
pub use frame::{ExecutionFrame, MAX_FRAME_DEPTH};

use pinokiod_core::{HostError, HostResult, InstallerKind, Script};
use std::path::{Path, PathBuf};

/// Load and parse a script file, detecting the dialect from the extension.
pub fn load_script_file(path: &Path) -> HostResult<(Script, InstallerKind)> {
    let text = std::fs::read_to_string(path).map_err(|err| HostError::ScriptParse {
        reason: format!("cannot read {}: {err}", path.display()),
    })?;
    let is_js = path.extension().is_some_and(|ext| ext == "js");
    if is_js {
        let body = strip_js_wrapper(&text).ok_or_else(|| HostError::ScriptParse {
            reason: format!(
                "{} is not a plain `module.exports = {{...}}` script",
                path.display()
            ),
        })?;
        Ok((Script::parse_str(body)?, InstallerKind::Js))
    } else {
        Ok((Script::parse_str(&text)?, InstallerKind::Json))
    }
}

/// First existing candidate in `dir`, in order.
pub fn find_script(dir: &Path, candidates: &[&str]) -> Option<PathBuf> {
    candidates
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
}

/// Accept `module.exports = { ... };` (with comment-free JSON inside) and
/// return the object literal.
fn strip_js_wrapper(text: &str) -> Option<&str> {
    let rest = text.trim().strip_prefix("module.exports")?.trim_start();
    let rest = rest.strip_prefix('=')?.trim();
    let rest = rest.strip_suffix(';').unwrap_or(rest).trim_end();
    rest.starts_with('{').then_some(rest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn js_wrapper_around_json_object_parses() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("install.js");
        std::fs::write(
            &path,
            "module.exports = {\n  \"run\": [{\"method\": \"shell.run\", \"params\": {\"message\": \"echo ok\"}}]\n};\n",
        )
        .unwrap();
        let (script, kind) = load_script_file(&path).unwrap();
        assert_eq!(kind, InstallerKind::Js);
        assert_eq!(script.run.len(), 1);
    }

    #[test]
    fn richer_js_fails_script_parse() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("install.js");
        std::fs::write(&path, "const x = 1;\nmodule.exports = async () => x;\n").unwrap();
        let err = load_script_file(&path).unwrap_err();
        assert_eq!(err.kind(), "script-parse");
    }

    #[test]
    fn discovery_walks_candidates_in_order() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("install.json"), "{}").unwrap();
        let found = find_script(tmp.path(), &["install.js", "install.json"]).unwrap();
        assert!(found.ends_with("install.json"));
        assert!(find_script(tmp.path(), &["start.js", "start.json"]).is_none());
    }
}
