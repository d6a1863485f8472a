//! Git sink against real repositories: a bare "remote", a second clone that
//! plays another writer, and the vault the sink manages.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

use pdf_relay::config::{AssetMode, GitOutputConfig, OutputConfig, OutputProvider};
use pdf_relay::error::SinkError;
use pdf_relay::ledger::{Ledger, RecordStatus};
use pdf_relay::models::{ArtifactFormat, ConversionResult, Document, OutputArtifact};
use pdf_relay::pipeline::{Pipeline, Stage};
use pdf_relay::sink_git::GitSink;
use pdf_relay::traits::{Connector, Converter, Sink};

fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .current_dir(dir)
        .args(["-c", "user.name=Other Writer", "-c", "user.email=other@example.com"])
        .args(args)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

struct Fixture {
    tmp: TempDir,
    remote: PathBuf,
    other: PathBuf,
    vault: PathBuf,
}

impl Fixture {
    /// A remote with one commit on `main`, and another writer's clone.
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let remote = tmp.path().join("remote.git");
        let other = tmp.path().join("other");
        let vault = tmp.path().join("vault");

        std::fs::create_dir_all(&remote).unwrap();
        git(&remote, &["init", "--quiet", "--bare"]);
        git(&remote, &["symbolic-ref", "HEAD", "refs/heads/main"]);

        std::fs::create_dir_all(&other).unwrap();
        git(&other, &["init", "--quiet"]);
        git(&other, &["symbolic-ref", "HEAD", "refs/heads/main"]);
        git(&other, &["remote", "add", "origin", remote.to_str().unwrap()]);
        std::fs::write(other.join("README.md"), "# Vault\n").unwrap();
        git(&other, &["add", "README.md"]);
        git(&other, &["commit", "--quiet", "-m", "init"]);
        git(&other, &["push", "--quiet", "origin", "main"]);

        Self {
            tmp,
            remote,
            other,
            vault,
        }
    }

    fn config(&self) -> OutputConfig {
        OutputConfig {
            provider: OutputProvider::Git,
            directory: PathBuf::from("notes"),
            git: Some(GitOutputConfig {
                repository_path: self.vault.clone(),
                repository_url: Some(self.remote.to_string_lossy().to_string()),
                branch: "main".into(),
                remote: "origin".into(),
                commit_message_template: "Add {document_name}".into(),
                push: true,
                embed_asset_links: true,
                private_key_path: None,
                known_hosts_path: None,
                author_name: Some("PDF Relay".into()),
                author_email: Some("relay@example.com".into()),
            }),
            ..OutputConfig::default()
        }
    }

    fn sink(&self) -> GitSink {
        GitSink::from_config(&self.config()).unwrap()
    }

    /// Another writer pushes a commit the vault has not seen.
    fn push_from_other(&self, file: &str, content: &str) {
        git(&self.other, &["pull", "--quiet", "--ff-only", "origin", "main"]);
        std::fs::write(self.other.join(file), content).unwrap();
        git(&self.other, &["add", file]);
        git(&self.other, &["commit", "--quiet", "-m", &format!("edit {}", file)]);
        git(&self.other, &["push", "--quiet", "origin", "main"]);
    }

    fn remote_head_subject(&self) -> String {
        git(&self.remote, &["log", "-1", "--format=%s", "main"])
    }
}

fn install_hook(path: &Path, script: &str) {
    std::fs::write(path, script).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

fn artifact(title: &str) -> OutputArtifact {
    OutputArtifact {
        document_id: format!("id-{}", title.to_lowercase()),
        title: title.into(),
        stem: format!("{}-20240918103000", title),
        format: ArtifactFormat::Markdown,
        body: format!("# {}\n\nbody", title),
        source: Some(b"%PDF-1.4 fake".to_vec()),
        page_images: vec![],
    }
}

#[test]
fn clones_writes_commits_and_pushes() {
    let fx = Fixture::new();
    let sink = fx.sink();
    assert!(fx.vault.join(".git").exists());
    assert!(sink.repository().ends_with("vault"));

    let path = sink.write(&artifact("Alpha")).unwrap();

    assert_eq!(path, "notes/Alpha-20240918103000.md");
    assert_eq!(
        std::fs::read_to_string(fx.vault.join(&path)).unwrap(),
        "# Alpha\n\nbody\n"
    );
    assert_eq!(git(&fx.vault, &["log", "-1", "--format=%s"]), "Add Alpha");
    assert_eq!(
        git(&fx.vault, &["log", "-1", "--format=%an <%ae>"]),
        "PDF Relay <relay@example.com>"
    );
    assert_eq!(fx.remote_head_subject(), "Add Alpha");
}

#[test]
fn fast_forwards_before_committing() {
    let fx = Fixture::new();
    let sink = fx.sink();
    fx.push_from_other("todo.md", "- [ ] scan receipts\n");

    sink.write(&artifact("Alpha")).unwrap();

    assert!(fx.vault.join("todo.md").exists());
    let subjects = git(&fx.vault, &["log", "--format=%s"]);
    assert_eq!(subjects.lines().collect::<Vec<_>>(), ["Add Alpha", "edit todo.md", "init"]);
    assert_eq!(fx.remote_head_subject(), "Add Alpha");
}

#[test]
fn refuses_to_write_over_dirty_tracked_files() {
    let fx = Fixture::new();
    let sink = fx.sink();
    std::fs::write(fx.vault.join("README.md"), "# Vault\n\nlocal edit\n").unwrap();

    let err = sink.write(&artifact("Alpha")).unwrap_err();

    assert!(err.is_sync_conflict());
    match err {
        SinkError::Dirty { paths } => assert_eq!(paths, ["README.md"]),
        other => panic!("expected Dirty, got {:?}", other),
    }
    assert!(!fx.vault.join("notes/Alpha-20240918103000.md").exists());
}

#[test]
fn untracked_files_do_not_block_writes() {
    let fx = Fixture::new();
    let sink = fx.sink();
    std::fs::write(fx.vault.join("scratch.txt"), "notes to self").unwrap();

    sink.write(&artifact("Alpha")).unwrap();

    let tracked = git(&fx.vault, &["ls-files"]);
    assert!(!tracked.contains("scratch.txt"));
}

#[test]
fn refuses_to_merge_diverged_history() {
    let fx = Fixture::new();
    let sink = fx.sink();

    std::fs::write(fx.vault.join("local.md"), "local\n").unwrap();
    git(&fx.vault, &["add", "local.md"]);
    git(&fx.vault, &["commit", "--quiet", "-m", "local only"]);
    fx.push_from_other("remote.md", "remote\n");

    let err = sink.write(&artifact("Alpha")).unwrap_err();

    assert!(err.is_sync_conflict());
    assert!(matches!(err, SinkError::Diverged { .. }));
    assert_eq!(git(&fx.vault, &["log", "-1", "--format=%s"]), "local only");
}

#[test]
fn unpushed_local_commits_are_not_a_conflict() {
    let fx = Fixture::new();
    let mut config = fx.config();
    if let Some(g) = config.git.as_mut() {
        g.push = false;
    }
    let sink = GitSink::from_config(&config).unwrap();

    sink.write(&artifact("Alpha")).unwrap();
    sink.write(&artifact("Bravo")).unwrap();

    assert_eq!(git(&fx.vault, &["rev-list", "--count", "HEAD"]), "3");
    assert_eq!(fx.remote_head_subject(), "init");
}

#[test]
fn rewriting_identical_content_makes_no_commit() {
    let fx = Fixture::new();
    let sink = fx.sink();

    let first = sink.write(&artifact("Alpha")).unwrap();
    let second = sink.write(&artifact("Alpha")).unwrap();

    assert_eq!(first, second);
    assert_eq!(git(&fx.vault, &["rev-list", "--count", "HEAD"]), "2");
}

#[test]
fn source_pdf_asset_is_committed_and_linked() {
    let fx = Fixture::new();
    let mut config = fx.config();
    config.asset_directory = Some(PathBuf::from("media"));
    config.asset_mode = AssetMode::Pdf;
    let sink = GitSink::from_config(&config).unwrap();

    let path = sink.write(&artifact("Alpha")).unwrap();

    let markdown = std::fs::read_to_string(fx.vault.join(&path)).unwrap();
    assert!(markdown.contains("[Reference PDF](media/Alpha-20240918103000.pdf)"));
    assert!(markdown.contains("![[media/Alpha-20240918103000.pdf]]"));
    let tracked = git(&fx.vault, &["ls-files"]);
    assert!(tracked.lines().any(|l| l == "media/Alpha-20240918103000.pdf"));
    assert_eq!(
        std::fs::read(fx.vault.join("media/Alpha-20240918103000.pdf")).unwrap(),
        b"%PDF-1.4 fake"
    );
}

#[test]
fn commit_message_template_placeholders() {
    let fx = Fixture::new();
    let mut config = fx.config();
    if let Some(g) = config.git.as_mut() {
        g.commit_message_template = "Import {document_name} ({document_id}) as {markdown_path}".into();
    }
    let sink = GitSink::from_config(&config).unwrap();

    sink.write(&artifact("Alpha")).unwrap();

    assert_eq!(
        git(&fx.vault, &["log", "-1", "--format=%s"]),
        "Import Alpha (id-alpha) as notes/Alpha-20240918103000.md"
    );
}

#[test]
fn repository_without_remote_commits_locally() {
    let tmp = TempDir::new().unwrap();
    let repo = tmp.path().join("solo");
    std::fs::create_dir_all(&repo).unwrap();
    git(&repo, &["init", "--quiet"]);

    let config = OutputConfig {
        provider: OutputProvider::Git,
        directory: PathBuf::from("inbox"),
        git: Some(GitOutputConfig {
            repository_path: repo.clone(),
            repository_url: None,
            branch: "main".into(),
            remote: "origin".into(),
            commit_message_template: "Add {document_name}".into(),
            push: false,
            embed_asset_links: true,
            private_key_path: None,
            known_hosts_path: None,
            author_name: Some("PDF Relay".into()),
            author_email: Some("relay@example.com".into()),
        }),
        ..OutputConfig::default()
    };
    let sink = GitSink::from_config(&config).unwrap();

    let path = sink.write(&artifact("Alpha")).unwrap();

    assert_eq!(path, "inbox/Alpha-20240918103000.md");
    assert_eq!(git(&repo, &["symbolic-ref", "--short", "HEAD"]), "main");
    assert_eq!(git(&repo, &["log", "-1", "--format=%s"]), "Add Alpha");
}

#[test]
fn missing_repository_without_url_is_a_config_error() {
    let fx = Fixture::new();
    let mut config = fx.config();
    if let Some(g) = config.git.as_mut() {
        g.repository_url = None;
        g.repository_path = fx.tmp.path().join("nowhere");
    }
    assert!(GitSink::from_config(&config).is_err());
}

#[test]
fn failed_commit_leaves_nothing_staged() {
    let fx = Fixture::new();
    let sink = fx.sink();
    install_hook(
        &fx.vault.join(".git/hooks/pre-commit"),
        "#!/bin/sh\nif git diff --cached --name-only | grep -q Bravo; then\n  echo 'no Bravo here' >&2\n  exit 1\nfi\n",
    );

    let err = sink.write(&artifact("Bravo")).unwrap_err();
    assert!(matches!(err, SinkError::Git { .. }));
    assert!(!err.is_sync_conflict());

    // An unrelated document still goes through.
    let path = sink.write(&artifact("Alpha")).unwrap();

    assert_eq!(path, "notes/Alpha-20240918103000.md");
    assert_eq!(git(&fx.vault, &["log", "-1", "--format=%s"]), "Add Alpha");
    assert_eq!(git(&fx.vault, &["status", "--porcelain", "--untracked-files=no"]), "");
    let tracked = git(&fx.vault, &["ls-files"]);
    assert!(!tracked.contains("Bravo"));
}

#[test]
fn failed_rewrite_restores_the_committed_file() {
    let fx = Fixture::new();
    let sink = fx.sink();
    let path = sink.write(&artifact("Alpha")).unwrap();
    let committed = std::fs::read_to_string(fx.vault.join(&path)).unwrap();
    install_hook(&fx.vault.join(".git/hooks/pre-commit"), "#!/bin/sh\nexit 1\n");

    let mut changed = artifact("Alpha");
    changed.body = "# Alpha\n\nrevised".into();
    assert!(sink.write(&changed).is_err());

    assert_eq!(std::fs::read_to_string(fx.vault.join(&path)).unwrap(), committed);
    assert_eq!(git(&fx.vault, &["status", "--porcelain", "--untracked-files=no"]), "");
}

#[test]
fn rejected_push_keeps_the_local_commit() {
    let fx = Fixture::new();
    let sink = fx.sink();
    let hook = fx.remote.join("hooks/pre-receive");
    install_hook(&hook, "#!/bin/sh\necho 'pushes disabled' >&2\nexit 1\n");

    let path = sink.write(&artifact("Alpha")).unwrap();

    assert_eq!(path, "notes/Alpha-20240918103000.md");
    assert_eq!(git(&fx.vault, &["log", "-1", "--format=%s"]), "Add Alpha");
    assert_eq!(fx.remote_head_subject(), "init");

    std::fs::remove_file(&hook).unwrap();
    sink.write(&artifact("Bravo")).unwrap();

    let subjects = git(&fx.remote, &["log", "--format=%s", "main"]);
    assert_eq!(subjects.lines().collect::<Vec<_>>(), ["Add Bravo", "Add Alpha", "init"]);
}

#[test]
fn mind_map_is_committed_without_asset_links() {
    let fx = Fixture::new();
    let mut config = fx.config();
    config.asset_directory = Some(PathBuf::from("media"));
    let sink = GitSink::from_config(&config).unwrap();
    let mut map = artifact("Trip");
    map.format = ArtifactFormat::MindMap;
    map.body = "<map version=\"1.0.1\">\n  <node TEXT=\"Trip\"/>\n</map>".into();

    let path = sink.write(&map).unwrap();

    assert_eq!(path, "notes/Trip-20240918103000.mm");
    assert_eq!(
        std::fs::read_to_string(fx.vault.join(&path)).unwrap(),
        "<map version=\"1.0.1\">\n  <node TEXT=\"Trip\"/>\n</map>\n"
    );
    let tracked = git(&fx.vault, &["ls-files"]);
    assert!(!tracked.contains("media/"));
    assert_eq!(fx.remote_head_subject(), "Add Trip");
}

// ============ Through the pipeline ============

struct OneDocument;

#[async_trait]
impl Connector for OneDocument {
    fn name(&self) -> &str {
        "one"
    }

    async fn list_pending(&self) -> Result<Vec<Document>> {
        Ok(vec![Document {
            id: "doc-1".into(),
            title: "Alpha".into(),
            size: Some(13),
            modified_time: Some(Utc.with_ymd_and_hms(2024, 9, 18, 10, 30, 0).unwrap()),
            source_ref: "doc-1".into(),
        }])
    }

    async fn fetch(&self, _document: &Document) -> Result<Vec<u8>> {
        Ok(b"%PDF-1.4 fake".to_vec())
    }
}

struct Heading;

#[async_trait]
impl Converter for Heading {
    fn name(&self) -> &str {
        "heading"
    }

    async fn convert(&self, _bytes: &[u8], filename: &str) -> Result<ConversionResult> {
        Ok(ConversionResult::markdown(format!("# {}", filename)))
    }
}

#[tokio::test]
async fn dirty_vault_is_retried_not_recorded_as_processed() {
    let fx = Fixture::new();
    let ledger_path = fx.tmp.path().join("ledger.json");
    let mut pipeline = Pipeline::new(
        Box::new(OneDocument),
        Box::new(Heading),
        Box::new(fx.sink()),
        Ledger::load(&ledger_path).unwrap(),
    )
    .with_failure_records(true);
    std::fs::write(fx.vault.join("README.md"), "# Vault\n\nlocal edit\n").unwrap();

    let report = pipeline.run_cycle().await.unwrap();

    assert!(report.written.is_empty());
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].stage, Stage::Write);
    assert!(report.failed[0].sync_conflict);

    // A failed record is kept for the operator but never counts as processed.
    let ledger = Ledger::load(&ledger_path).unwrap();
    assert!(!ledger.is_processed("doc-1"));
    assert_eq!(ledger.record("doc-1").unwrap().status, RecordStatus::Failed);

    assert_eq!(git(&fx.vault, &["rev-list", "--count", "HEAD"]), "1");
    assert!(!fx.vault.join("notes/Alpha-20240918103000.md").exists());

    // Once the operator cleans up, the next cycle writes it.
    git(&fx.vault, &["checkout", "--", "README.md"]);
    let report = pipeline.run_cycle().await.unwrap();
    assert_eq!(report.written.len(), 1);
    assert!(pipeline.ledger().is_processed("doc-1"));
    assert_eq!(fx.remote_head_subject(), "Add Alpha");
}
