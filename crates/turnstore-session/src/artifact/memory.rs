//! In-memory artifact storage.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{validate_filename, Artifact, ArtifactScope, ArtifactStore};
use crate::error::Result;

/// `(app, user, session or "", filename)`
type ChainKey = (String, String, String, String);

/// Artifact store held in process memory. Version `n` is index `n` of its chain.
#[derive(Default)]
pub struct InMemoryArtifactStore {
    chains: RwLock<HashMap<ChainKey, Vec<Artifact>>>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn chain_key(scope: &ArtifactScope, filename: &str) -> ChainKey {
    (
        scope.app_name.clone(),
        scope.user_id.clone(),
        scope.session_for(filename).to_string(),
        filename.to_string(),
    )
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn save_artifact(
        &self,
        scope: &ArtifactScope,
        filename: &str,
        artifact: Artifact,
    ) -> Result<u32> {
        validate_filename(filename)?;
        let mut chains = self.chains.write();
        let chain = chains.entry(chain_key(scope, filename)).or_default();
        let version = chain.len() as u32;
        chain.push(artifact);

        tracing::debug!(filename, version, session = %scope.session_id, "Saved artifact");
        Ok(version)
    }

    async fn load_artifact(
        &self,
        scope: &ArtifactScope,
        filename: &str,
        version: Option<u32>,
    ) -> Result<Option<Artifact>> {
        let chains = self.chains.read();
        let Some(chain) = chains.get(&chain_key(scope, filename)) else {
            return Ok(None);
        };
        Ok(match version {
            Some(v) => chain.get(v as usize).cloned(),
            None => chain.last().cloned(),
        })
    }

    async fn list_artifact_keys(&self, scope: &ArtifactScope) -> Result<Vec<String>> {
        let chains = self.chains.read();
        let mut keys: Vec<String> = chains
            .iter()
            .filter(|((app, user, session, _), chain)| {
                !chain.is_empty()
                    && *app == scope.app_name
                    && *user == scope.user_id
                    && (session.is_empty() || *session == scope.session_id)
            })
            .map(|((_, _, _, filename), _)| filename.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn list_versions(&self, scope: &ArtifactScope, filename: &str) -> Result<Vec<u32>> {
        let chains = self.chains.read();
        Ok(chains
            .get(&chain_key(scope, filename))
            .map(|chain| (0..chain.len() as u32).collect())
            .unwrap_or_default())
    }

    async fn delete_artifact(&self, scope: &ArtifactScope, filename: &str) -> Result<()> {
        self.chains.write().remove(&chain_key(scope, filename));
        Ok(())
    }

    async fn truncate_artifact(
        &self,
        scope: &ArtifactScope,
        filename: &str,
        keep_up_to: Option<u32>,
    ) -> Result<Vec<(u32, Artifact)>> {
        let key = chain_key(scope, filename);
        let mut chains = self.chains.write();
        let Some(chain) = chains.get_mut(&key) else {
            return Ok(Vec::new());
        };

        let keep = keep_up_to.map(|v| v as usize + 1).unwrap_or(0);
        if keep >= chain.len() {
            return Ok(Vec::new());
        }

        let removed = chain
            .drain(keep..)
            .enumerate()
            .map(|(offset, artifact)| ((keep + offset) as u32, artifact))
            .collect();
        if chain.is_empty() {
            chains.remove(&key);
        }
        Ok(removed)
    }

    async fn delete_session_artifacts(&self, scope: &ArtifactScope) -> Result<()> {
        if scope.session_id.is_empty() {
            return Ok(());
        }
        self.chains.write().retain(|(app, user, session, _), _| {
            !(*app == scope.app_name && *user == scope.user_id && *session == scope.session_id)
        });
        Ok(())
    }
}
