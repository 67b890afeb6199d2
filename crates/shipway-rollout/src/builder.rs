//! Artifact building.
//!
//! Building is an external concern: shipway runs the configured build
//! command and takes the last non-empty line it prints on stdout as the
//! artifact reference (an image tag, a binary path, …). Prebuilt
//! `image:` sources skip the build entirely.

use std::process::Stdio;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::process::Command;
use tracing::{debug, info};

use shipway_core::{BuildPlan, SourceRef};
use shipway_state::{Artifact, epoch_millis};

use crate::error::BuildError;

/// Build output retained in a failure message.
const OUTPUT_TAIL_BYTES: usize = 2048;

#[async_trait]
pub trait ArtifactBuilder: Send + Sync {
    async fn build(&self, source: &str) -> Result<Artifact, BuildError>;
}

/// Content id of an artifact reference: the first 16 hex chars of its sha256.
pub fn artifact_id(reference: &str) -> String {
    let digest = Sha256::digest(reference.as_bytes());
    hex::encode(digest)[..16].to_string()
}

/// Runs `build.command` for each source.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    plan: Option<BuildPlan>,
}

impl CommandBuilder {
    pub fn new(plan: Option<BuildPlan>) -> Self {
        Self { plan }
    }
}

#[async_trait]
impl ArtifactBuilder for CommandBuilder {
    async fn build(&self, source: &str) -> Result<Artifact, BuildError> {
        let parsed = SourceRef::parse(source)?;

        let reference = match &parsed {
            SourceRef::Image { reference } => {
                debug!(%source, "prebuilt image, skipping build");
                reference.clone()
            }
            _ => {
                let plan = self.plan.as_ref().ok_or(BuildError::NoBuildCommand)?;
                run_build(plan, source, &parsed).await?
            }
        };

        let artifact = Artifact {
            id: artifact_id(&reference),
            source: source.to_string(),
            reference,
            created_at: epoch_millis(),
        };
        info!(%source, artifact = %artifact.id, reference = %artifact.reference, "artifact built");
        Ok(artifact)
    }
}

async fn run_build(plan: &BuildPlan, source: &str, parsed: &SourceRef) -> Result<String, BuildError> {
    let (exe, args) = plan.command.split_first().ok_or(BuildError::NoBuildCommand)?;

    let mut cmd = Command::new(exe);
    cmd.args(args)
        .env("SHIPWAY_SOURCE", source)
        .envs(parsed.env())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd.spawn().map_err(|e| BuildError::Spawn(format!("{exe}: {e}")))?;
    let output = tokio::time::timeout(plan.timeout, child.wait_with_output())
        .await
        .map_err(|_| BuildError::TimedOut(plan.timeout))?
        .map_err(|e| BuildError::Spawn(e.to_string()))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !output.status.success() {
        let mut combined = stdout.into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        return Err(BuildError::Failed {
            exit_code: output.status.code(),
            output: tail(combined.trim_end(), OUTPUT_TAIL_BYTES).to_string(),
        });
    }

    stdout
        .lines()
        .map(str::trim)
        .rfind(|line| !line.is_empty())
        .map(str::to_string)
        .ok_or(BuildError::NoArtifact)
}

fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn builder(command: &[&str]) -> CommandBuilder {
        CommandBuilder::new(Some(BuildPlan {
            command: command.iter().map(|s| s.to_string()).collect(),
            timeout: Duration::from_secs(30),
        }))
    }

    #[test]
    fn artifact_ids_are_stable_content_hashes() {
        let a = artifact_id("registry/app:1");
        assert_eq!(a.len(), 16);
        assert_eq!(a, artifact_id("registry/app:1"));
        assert_ne!(a, artifact_id("registry/app:2"));
    }

    #[tokio::test]
    async fn image_source_skips_build() {
        let artifact = CommandBuilder::new(None).build("image:registry/app:v3").await.unwrap();
        assert_eq!(artifact.reference, "registry/app:v3");
        assert_eq!(artifact.source, "image:registry/app:v3");
        assert_eq!(artifact.id, artifact_id("registry/app:v3"));
    }

    #[tokio::test]
    async fn last_stdout_line_is_the_reference() {
        let b = builder(&["sh", "-c", "echo compiling; echo registry/app:$SHIPWAY_SOURCE_SCHEME; echo"]);
        let artifact = b.build("./app").await.unwrap();
        assert_eq!(artifact.reference, "registry/app:local");
    }

    #[tokio::test]
    async fn failing_build_reports_output() {
        let b = builder(&["sh", "-c", "echo 'error[E0308]: mismatched types' >&2; exit 101"]);
        match b.build("./app").await.unwrap_err() {
            BuildError::Failed { exit_code, output } => {
                assert_eq!(exit_code, Some(101));
                assert!(output.contains("E0308"));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn silent_build_has_no_artifact() {
        let b = builder(&["true"]);
        assert!(matches!(b.build("./app").await, Err(BuildError::NoArtifact)));
    }

    #[tokio::test]
    async fn source_needs_a_build_command() {
        let b = CommandBuilder::new(None);
        assert!(matches!(b.build("./app").await, Err(BuildError::NoBuildCommand)));
        assert!(matches!(b.build("ftp://nope").await, Err(BuildError::Source(_))));
    }
}
