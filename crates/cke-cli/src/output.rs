use std::io::Read;

use anyhow::{Context, Result};
use serde::Serialize;

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("encode JSON")?);
    Ok(())
}

pub fn print_yaml<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    print!("{}", serde_yaml::to_string(value).context("encode YAML")?);
    Ok(())
}

pub fn print_bool(v: bool) {
    println!("{v}");
}

/// Read a file argument; `-` reads stdin.
pub fn read_input(path: &str) -> Result<String> {
    if path == "-" {
        let mut s = String::new();
        std::io::stdin().read_to_string(&mut s).context("read stdin")?;
        return Ok(s);
    }
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {path}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_read_input_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, "name: test").unwrap();
        let s = read_input(f.path().to_str().unwrap()).unwrap();
        assert_eq!(s, "name: test");
    }

    #[test]
    fn test_read_input_missing() {
        let err = read_input("/nonexistent/cluster.yml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/cluster.yml"));
    }
}
