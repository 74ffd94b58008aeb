use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Lit un fichier ligne à ligne en ignorant les lignes vides et les
/// commentaires `#`.
pub fn load_lines(path: &Path) -> Result<Vec<String>> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("lecture de {}", path.display()))?;
    Ok(data
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

/// Charge les clés privées en normalisant le préfixe `0x`.
pub fn load_private_keys(path: &Path) -> Result<Vec<String>> {
    let keys = load_lines(path)?
        .into_iter()
        .map(|key| {
            if key.starts_with("0x") {
                key
            } else {
                format!("0x{key}")
            }
        })
        .collect();
    Ok(keys)
}

/// Charge la liste des proxies, un URI par ligne, assignés aux comptes par
/// index.
pub fn load_proxies(path: &Path) -> Result<Vec<String>> {
    load_lines(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn private_keys_are_normalized_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("privateKeys.txt");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(file, "# clés de test").unwrap();
        writeln!(file, "0xabc123").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "  def456  ").unwrap();
        drop(file);

        let keys = load_private_keys(&path).unwrap();
        assert_eq!(keys, vec!["0xabc123".to_string(), "0xdef456".to_string()]);
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_private_keys(&dir.path().join("absent.txt")).is_err());
    }
}
