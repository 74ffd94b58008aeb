use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

/// Magasin JSON durable `adresse -> valeur`, partagé entre tous les workers.
///
/// Les lectures passent par un snapshot ArcSwap, sans verrou. Les écritures
/// relisent le fichier complet, fusionnent la seule entrée du compte
/// appelant, puis réécrivent: comme chaque worker n'écrit que sa propre clé,
/// deux écritures concurrentes ne peuvent pas se corrompre mutuellement.
pub struct JsonStore {
    path: PathBuf,
    snapshot: ArcSwap<HashMap<String, String>>,
    write_lock: Mutex<()>,
}

/// Cache des bearer tokens, relu à chaque début de cycle.
pub type TokenStore = JsonStore;
/// User agents persistés pour garder une identité stable par adresse.
pub type UserAgentStore = JsonStore;

impl JsonStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let map = Self::read_file(&path)?;
        Ok(Self {
            path,
            snapshot: ArcSwap::from_pointee(map),
            write_lock: Mutex::new(()),
        })
    }

    fn read_file(path: &Path) -> Result<HashMap<String, String>> {
        match std::fs::read_to_string(path) {
            Ok(data) => match serde_json::from_str(&data) {
                Ok(map) => Ok(map),
                Err(e) => {
                    // Fichier corrompu: on repart de zéro plutôt que de
                    // bloquer tous les comptes.
                    warn!("[Store] Fichier {} illisible, ignoré: {e}", path.display());
                    Ok(HashMap::new())
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e).with_context(|| format!("lecture de {}", path.display())),
        }
    }

    /// Recharge le snapshot depuis le disque, pour honorer les entrées
    /// rafraîchies par un autre process entre deux cycles.
    pub fn reload(&self) -> Result<()> {
        let map = Self::read_file(&self.path)?;
        self.snapshot.store(Arc::new(map));
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.snapshot.load().get(key).cloned()
    }

    /// Écrit l'entrée d'une seule clé: read-modify-write du fichier complet
    /// sous verrou, les autres entrées sont préservées telles quelles.
    pub async fn put(&self, key: &str, value: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut map = Self::read_file(&self.path)?;
        map.insert(key.to_string(), value.to_string());
        let data = serde_json::to_string_pretty(&map)?;
        std::fs::write(&self.path, data)
            .with_context(|| format!("écriture de {}", self.path.display()))?;
        self.snapshot.store(Arc::new(map));
        Ok(())
    }
}
