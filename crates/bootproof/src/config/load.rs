use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use toml::Value;

use crate::error::{Error, Result};

fn merge_values(base: &mut Value, child: Value) {
    match (base, child) {
        (Value::Table(base_tbl), Value::Table(child_tbl)) => {
            for (k, v) in child_tbl {
                match base_tbl.get_mut(&k) {
                    Some(existing) => merge_values(existing, v),
                    None => {
                        base_tbl.insert(k, v);
                    }
                }
            }
        }
        (base_slot, child_val) => {
            *base_slot = child_val;
        }
    }
}

fn resolve_ref_path(from_file: &Path, reference: &str) -> PathBuf {
    let p = PathBuf::from(reference);
    if p.is_absolute() {
        p
    } else {
        from_file.parent().unwrap_or_else(|| Path::new(".")).join(p)
    }
}

fn load_value_inner(path: &Path, stack: &mut HashSet<PathBuf>) -> Result<Value> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !stack.insert(canonical.clone()) {
        return Err(Error::msg(format!(
            "config extends cycle detected at {}",
            canonical.display()
        )));
    }

    let data = fs::read_to_string(path)
        .map_err(|e| Error::msg(format!("failed to read config {}: {e}", path.display())))?;
    let mut value: Value = toml::from_str(&data)
        .map_err(|e| Error::msg(format!("TOML parse error in {}: {e}", path.display())))?;

    let mut out = Value::Table(Default::default());
    if let Some(ext) = value.get("extends").and_then(Value::as_str) {
        let base_path = resolve_ref_path(path, ext);
        out = load_value_inner(&base_path, stack)?;
    }
    if let Some(tbl) = value.as_table_mut() {
        tbl.remove("extends");
    }
    merge_values(&mut out, value);

    stack.remove(&canonical);
    Ok(out)
}

/// Read `path` and every file it `extends`, base first, child tables merged
/// over their parents key by key.
pub fn load_value(path: &Path) -> Result<Value> {
    let mut stack = HashSet::<PathBuf>::new();
    load_value_inner(path, &mut stack)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_tables_override_base_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(
            dir.path().join("base.toml"),
            "[queue]\ncapacity = 10\nmax_attempts = 5\n[paths]\ndevice_dir = \"/base\"\n",
        )
        .expect("write base");
        let child = dir.path().join("child.toml");
        fs::write(&child, "extends = \"base.toml\"\n[queue]\ncapacity = 4\n").expect("write child");

        let v = load_value(&child).expect("load");
        assert_eq!(v["queue"]["capacity"].as_integer(), Some(4));
        assert_eq!(v["queue"]["max_attempts"].as_integer(), Some(5));
        assert_eq!(v["paths"]["device_dir"].as_str(), Some("/base"));
        assert!(v.get("extends").is_none());
    }

    #[test]
    fn extends_cycle_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("a.toml"), "extends = \"b.toml\"\n").expect("write a");
        fs::write(dir.path().join("b.toml"), "extends = \"a.toml\"\n").expect("write b");
        let err = load_value(&dir.path().join("a.toml")).unwrap_err();
        assert!(err.to_string().contains("cycle"), "{err}");
    }
}
