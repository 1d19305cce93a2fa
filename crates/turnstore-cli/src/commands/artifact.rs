//! Artifact inspection commands.

use turnstore_core::Config;
use turnstore_session::{ArtifactScope, SessionService};

use super::open_service;
use crate::ArtifactAction;

pub async fn handle(action: ArtifactAction, config: &Config) -> anyhow::Result<()> {
    let service = open_service(config)?;
    run(&service, action).await
}

async fn run(service: &SessionService, action: ArtifactAction) -> anyhow::Result<()> {
    match action {
        ArtifactAction::List { app, user, session } => {
            let scope = ArtifactScope::new(app, user, session);
            let keys = service.list_artifact_keys(&scope).await?;
            if keys.is_empty() {
                println!("No artifacts found.");
                return Ok(());
            }

            println!("Artifacts ({}):", keys.len());
            for filename in &keys {
                let versions = service.list_artifact_versions(&scope, filename).await?;
                println!("  {}  ({} versions)", filename, versions.len());
            }
        }
        ArtifactAction::Show {
            app,
            user,
            session,
            filename,
            version,
        } => {
            let scope = ArtifactScope::new(app, user, session);
            let versions = service.list_artifact_versions(&scope, &filename).await?;
            let Some(artifact) = service.load_artifact(&scope, &filename, version).await? else {
                match version {
                    Some(v) => println!("Artifact not found: {} version {}", filename, v),
                    None => println!("Artifact not found: {}", filename),
                }
                return Ok(());
            };

            let shown = version.or(versions.last().copied()).unwrap_or(0);
            println!("Artifact: {}", filename);
            println!("Version:  {} of {:?}", shown, versions);
            println!("Type:     {}", artifact.mime_type);
            println!("Size:     {} bytes", artifact.data.len());
            println!();
            match artifact.as_text() {
                Some(text) => println!("{}", text),
                None => println!("(binary content not shown)"),
            }
        }
    }

    Ok(())
}
