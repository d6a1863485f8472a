//! Git repository sink.
//!
//! Every artifact becomes one commit in a working copy, typically an
//! Obsidian vault. Before anything is written the sink makes sure it can
//! add to the branch safely:
//!
//! 1. Tracked files must be clean (`git status --porcelain`); otherwise the
//!    write is refused with [`SinkError::Dirty`].
//! 2. `git fetch <remote> <branch>`, then fast-forward when the remote is
//!    ahead. If local and remote have both moved the write is refused with
//!    [`SinkError::Diverged`].
//!
//! Then the files are written, staged and committed. Pushing is optional
//! and best-effort: a failed push is logged, the commit stays, and the next
//! successful push carries it.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use crate::config::{GitOutputConfig, OutputConfig};
use crate::error::SinkError;
use crate::models::OutputArtifact;
use crate::render::{self, AssetKind, AssetPolicy};
use crate::sink_fs;
use crate::traits::Sink;

pub struct GitSink {
    repo: PathBuf,
    markdown_dir: PathBuf,
    asset_dir: Option<PathBuf>,
    policy: AssetPolicy,
    branch: String,
    remote: String,
    commit_template: String,
    push: bool,
    embed_links: bool,
    identity: Vec<String>,
    ssh_command: Option<String>,
}

impl GitSink {
    /// Open (cloning first if needed) the configured repository and check
    /// out the target branch.
    pub fn from_config(output: &OutputConfig) -> Result<Self> {
        let git = output
            .git
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("[output.git] is not configured"))?;

        let ssh_command = ssh_command(git)?;
        let mut identity = Vec::new();
        if let Some(name) = &git.author_name {
            identity.push(format!("user.name={}", name));
        }
        if let Some(email) = &git.author_email {
            identity.push(format!("user.email={}", email));
        }

        if !git.repository_path.join(".git").exists() {
            match &git.repository_url {
                Some(url) => clone(url, &git.branch, &git.repository_path, ssh_command.as_deref())?,
                None => bail!(
                    "Git repository not found at {} and no repository_url to clone from",
                    git.repository_path.display()
                ),
            }
        }

        let repo = std::fs::canonicalize(&git.repository_path).with_context(|| {
            format!("Failed to resolve {}", git.repository_path.display())
        })?;

        let mut sink = Self {
            markdown_dir: PathBuf::new(),
            asset_dir: None,
            policy: AssetPolicy::from_output_config(output),
            branch: git.branch.clone(),
            remote: git.remote.clone(),
            commit_template: git.commit_message_template.clone(),
            push: git.push,
            embed_links: git.embed_asset_links,
            identity,
            ssh_command,
            repo,
        };

        sink.verify_repository()?;
        sink.ensure_branch()?;
        sink.markdown_dir = resolve_within(&sink.repo, &output.directory)?;
        sink.asset_dir = output
            .asset_directory
            .as_ref()
            .map(|dir| resolve_within(&sink.repo, dir))
            .transpose()?;
        Ok(sink)
    }

    pub fn repository(&self) -> &Path {
        &self.repo
    }

    // ============ Git plumbing ============

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new("git");
        cmd.current_dir(&self.repo);
        for entry in &self.identity {
            cmd.args(["-c", entry]);
        }
        cmd.args(args);
        cmd.env("GIT_TERMINAL_PROMPT", "0");
        if let Some(ssh) = &self.ssh_command {
            cmd.env("GIT_SSH_COMMAND", ssh);
        }
        cmd
    }

    fn run(&self, args: &[&str]) -> Result<Output, SinkError> {
        self.command(args).output().map_err(|e| SinkError::Git {
            command: args.first().copied().unwrap_or_default().to_string(),
            stderr: format!("failed to execute git: {}", e),
        })
    }

    /// Run and require a zero exit status; returns trimmed stdout.
    fn git(&self, args: &[&str]) -> Result<String, SinkError> {
        let output = self.run(args)?;
        if !output.status.success() {
            return Err(SinkError::Git {
                command: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// `git merge-base --is-ancestor`: exit 0 is yes, 1 is no.
    fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool, SinkError> {
        let args = ["merge-base", "--is-ancestor", ancestor, descendant];
        let output = self.run(&args)?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(SinkError::Git {
                command: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }),
        }
    }

    fn verify_repository(&self) -> Result<()> {
        let inside = self
            .git(&["rev-parse", "--is-inside-work-tree"])
            .map_err(anyhow::Error::from)
            .with_context(|| format!("Not a git repository: {}", self.repo.display()))?;
        if inside != "true" {
            bail!("Not a git work tree: {}", self.repo.display());
        }
        Ok(())
    }

    fn ensure_branch(&self) -> Result<()> {
        let current = self.git(&["symbolic-ref", "--short", "HEAD"]).unwrap_or_default();
        if current == self.branch {
            return Ok(());
        }
        if self.git(&["checkout", &self.branch]).is_err() {
            self.git(&["checkout", "-b", &self.branch])
                .map_err(anyhow::Error::from)
                .with_context(|| format!("Failed to check out branch '{}'", self.branch))?;
        }
        Ok(())
    }

    // ============ Sync ============

    fn ensure_clean(&self) -> Result<(), SinkError> {
        let args = ["status", "--porcelain", "--untracked-files=no"];
        let output = self.run(&args)?;
        if !output.status.success() {
            return Err(SinkError::Git {
                command: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        // Porcelain lines are `XY <path>`; the leading status column matters.
        let stdout = String::from_utf8_lossy(&output.stdout);
        let paths: Vec<String> = stdout
            .lines()
            .filter(|l| l.len() > 3)
            .map(|l| l[3..].to_string())
            .collect();
        if paths.is_empty() {
            Ok(())
        } else {
            Err(SinkError::Dirty { paths })
        }
    }

    fn sync_with_remote(&self) -> Result<(), SinkError> {
        if !self.run(&["remote", "get-url", &self.remote])?.status.success() {
            tracing::debug!(remote = %self.remote, "no such remote; committing locally");
            return Ok(());
        }
        let args = ["ls-remote", "--exit-code", "--heads", &self.remote, &self.branch];
        let listed = self.run(&args)?;
        match listed.status.code() {
            Some(0) => {}
            Some(2) => {
                tracing::debug!(remote = %self.remote, branch = %self.branch, "remote branch does not exist yet");
                return Ok(());
            }
            _ => {
                return Err(SinkError::Git {
                    command: args.join(" "),
                    stderr: String::from_utf8_lossy(&listed.stderr).trim().to_string(),
                })
            }
        }

        self.git(&["fetch", "--quiet", &self.remote, &self.branch])?;

        if self.git(&["rev-parse", "--verify", "--quiet", "HEAD"]).is_err() {
            // Unborn branch: adopt the remote history as-is.
            self.git(&["merge", "--ff-only", "FETCH_HEAD"])?;
            return Ok(());
        }

        if self.is_ancestor("HEAD", "FETCH_HEAD")? {
            let head = self.git(&["rev-parse", "HEAD"])?;
            let fetched = self.git(&["rev-parse", "FETCH_HEAD"])?;
            if head != fetched {
                tracing::debug!(remote = %self.remote, branch = %self.branch, "fast-forwarding");
                self.git(&["merge", "--ff-only", "--quiet", "FETCH_HEAD"])?;
            }
            Ok(())
        } else if self.is_ancestor("FETCH_HEAD", "HEAD")? {
            // Local commits not pushed yet; the next push carries them.
            Ok(())
        } else {
            Err(SinkError::Diverged {
                remote: self.remote.clone(),
                branch: self.branch.clone(),
            })
        }
    }

    // ============ Write ============

    fn relative(&self, path: &Path) -> String {
        let rel = path.strip_prefix(&self.repo).unwrap_or(path);
        rel.components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }

    fn commit_message(&self, artifact: &OutputArtifact, markdown_path: &str) -> String {
        self.commit_template
            .replace("{document_name}", &artifact.title)
            .replace("{document_identifier}", &artifact.document_id)
            .replace("{document_id}", &artifact.document_id)
            .replace("{markdown_path}", markdown_path)
    }

    fn push_best_effort(&self) {
        let refspec = format!("HEAD:{}", self.branch);
        match self.git(&["push", "--quiet", &self.remote, &refspec]) {
            Ok(_) => tracing::debug!(remote = %self.remote, branch = %self.branch, "pushed"),
            Err(e) => tracing::warn!(
                remote = %self.remote,
                branch = %self.branch,
                error = %e,
                "push failed; commit kept locally"
            ),
        }
    }
}

impl Sink for GitSink {
    fn name(&self) -> &str {
        "git"
    }

    fn write(&self, artifact: &OutputArtifact) -> Result<String, SinkError> {
        self.ensure_clean()?;
        self.sync_with_remote()?;

        let assets = render::build_assets(artifact, &self.policy)?;
        let planned = sink_fs::asset_paths(self.asset_dir.as_deref(), &assets);
        let markdown = if self.embed_links {
            let links: Vec<(String, AssetKind)> = planned
                .iter()
                .map(|(path, kind)| (self.relative(path), *kind))
                .collect();
            append_asset_links(&artifact.body, &links)
        } else {
            artifact.body.clone()
        };

        let written = sink_fs::write_files(
            &self.markdown_dir,
            self.asset_dir.as_deref(),
            artifact,
            &assets,
            &markdown,
        )?;

        let markdown_rel = self.relative(&written.markdown_path);
        let mut paths = vec![markdown_rel.clone()];
        paths.extend(written.assets.iter().map(|(p, _)| self.relative(p)));

        let mut add = vec!["add", "--"];
        add.extend(paths.iter().map(String::as_str));
        self.git(&add)?;

        let committed = match self.commit_staged(artifact, &paths, &markdown_rel) {
            Ok(committed) => committed,
            Err(e) => {
                self.unstage(&paths);
                self.restore_tracked(&paths);
                return Err(e);
            }
        };
        if !committed {
            self.unstage(&paths);
            return Ok(markdown_rel);
        }

        if self.push {
            self.push_best_effort();
        }
        Ok(markdown_rel)
    }
}

impl GitSink {
    /// Commit `paths` if staging them changed anything. `Ok(false)` means
    /// the index already matched HEAD.
    fn commit_staged(
        &self,
        artifact: &OutputArtifact,
        paths: &[String],
        markdown_rel: &str,
    ) -> Result<bool, SinkError> {
        let mut diff = vec!["diff", "--cached", "--quiet", "--"];
        diff.extend(paths.iter().map(String::as_str));
        let staged = self.run(&diff)?;
        match staged.status.code() {
            Some(0) => {
                tracing::info!(path = %markdown_rel, "content unchanged; nothing to commit");
                return Ok(false);
            }
            Some(1) => {}
            _ => {
                return Err(SinkError::Git {
                    command: "diff --cached".into(),
                    stderr: String::from_utf8_lossy(&staged.stderr).trim().to_string(),
                })
            }
        }

        let message = self.commit_message(artifact, markdown_rel);
        let mut commit = vec!["commit", "--quiet", "-m", message.as_str(), "--"];
        commit.extend(paths.iter().map(String::as_str));
        self.git(&commit)?;
        tracing::info!(path = %markdown_rel, message = %message, "committed");
        Ok(true)
    }

    /// Drop our paths from the index so the next write does not see them
    /// as uncommitted changes.
    fn unstage(&self, paths: &[String]) {
        let mut reset = vec!["reset", "-q", "--"];
        reset.extend(paths.iter().map(String::as_str));
        if let Err(e) = self.git(&reset) {
            tracing::warn!(error = %e, "failed to unstage written files");
        }
    }

    /// Put tracked paths back to their committed content; new files stay
    /// untracked and do not count as dirty.
    fn restore_tracked(&self, paths: &[String]) {
        let mut ls = vec!["ls-files", "--"];
        ls.extend(paths.iter().map(String::as_str));
        let tracked = match self.git(&ls) {
            Ok(out) => out,
            Err(e) => {
                tracing::warn!(error = %e, "failed to list written files");
                return;
            }
        };
        let tracked: Vec<&str> = tracked.lines().filter(|l| !l.is_empty()).collect();
        if tracked.is_empty() {
            return;
        }
        let mut checkout = vec!["checkout", "-q", "--"];
        checkout.extend(tracked);
        if let Err(e) = self.git(&checkout) {
            tracing::warn!(error = %e, "failed to restore written files");
        }
    }
}

/// Append Obsidian-style links and embeds for the written assets.
pub fn append_asset_links(markdown: &str, assets: &[(String, AssetKind)]) -> String {
    if assets.is_empty() {
        return markdown.to_string();
    }
    let mut lines = vec![markdown.trim_end().to_string(), String::new()];

    let pages: Vec<String> = assets
        .iter()
        .filter_map(|(path, kind)| match kind {
            AssetKind::Page(n) => Some(format!("[Page {}]({})", n, path)),
            AssetKind::SourcePdf => None,
        })
        .collect();

    for (path, kind) in assets {
        if *kind == AssetKind::SourcePdf {
            lines.push(format!("[Reference PDF]({})", path));
        }
    }
    if !pages.is_empty() {
        lines.push(pages.join(" "));
    }
    for (path, _) in assets {
        lines.push(format!("![[{}]]", path));
    }
    lines.push(String::new());
    lines.join("\n")
}

fn clone(url: &str, branch: &str, dest: &Path, ssh_command: Option<&str>) -> Result<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let mut cmd = Command::new("git");
    cmd.args(["clone", "--branch", branch, "--single-branch", url]);
    cmd.arg(dest);
    cmd.env("GIT_TERMINAL_PROMPT", "0");
    if let Some(ssh) = ssh_command {
        cmd.env("GIT_SSH_COMMAND", ssh);
    }

    let output = cmd
        .output()
        .with_context(|| "Failed to execute 'git clone'. Is git installed?")?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("git clone failed: {}", stderr.trim());
    }
    tracing::info!(url, dest = %dest.display(), "cloned output repository");
    Ok(())
}

fn ssh_command(git: &GitOutputConfig) -> Result<Option<String>> {
    if git.private_key_path.is_none() && git.known_hosts_path.is_none() {
        return Ok(None);
    }
    let mut parts = vec!["ssh".to_string()];
    if let Some(key) = &git.private_key_path {
        if !key.exists() {
            bail!("SSH private key not found: {}", key.display());
        }
        parts.push("-i".into());
        parts.push(shell_quote(&key.to_string_lossy()));
    }
    if let Some(known_hosts) = &git.known_hosts_path {
        parts.push("-o".into());
        parts.push(shell_quote(&format!(
            "UserKnownHostsFile={}",
            known_hosts.to_string_lossy()
        )));
    }
    parts.push("-o".into());
    parts.push("StrictHostKeyChecking=yes".into());
    Ok(Some(parts.join(" ")))
}

fn shell_quote(value: &str) -> String {
    if value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "/._-=~".contains(c))
    {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', "'\\''"))
    }
}

/// Resolve `path` against the repository and insist it stays inside it.
fn resolve_within(repo: &Path, path: &Path) -> Result<PathBuf> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        repo.join(path)
    };
    std::fs::create_dir_all(&joined)
        .with_context(|| format!("Failed to create {}", joined.display()))?;
    let resolved = std::fs::canonicalize(&joined)
        .with_context(|| format!("Failed to resolve {}", joined.display()))?;
    if !resolved.starts_with(repo) {
        bail!(
            "{} must be inside the repository {}",
            path.display(),
            repo.display()
        );
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pdf_links_reference_and_embed() {
        let md = append_asset_links(
            "# Scan\n\nbody\n\n",
            &[("media/Scan-1.pdf".into(), AssetKind::SourcePdf)],
        );
        assert_eq!(
            md,
            "# Scan\n\nbody\n\n[Reference PDF](media/Scan-1.pdf)\n![[media/Scan-1.pdf]]\n"
        );
    }

    #[test]
    fn page_links_on_one_line_then_embeds() {
        let md = append_asset_links(
            "# Scan",
            &[
                ("m/S-p01.png".into(), AssetKind::Page(1)),
                ("m/S-p02.png".into(), AssetKind::Page(2)),
            ],
        );
        assert_eq!(
            md,
            "# Scan\n\n[Page 1](m/S-p01.png) [Page 2](m/S-p02.png)\n![[m/S-p01.png]]\n![[m/S-p02.png]]\n"
        );
    }

    #[test]
    fn no_assets_leaves_markdown_alone() {
        assert_eq!(append_asset_links("# x", &[]), "# x");
    }

    #[test]
    fn quoting_only_when_needed() {
        assert_eq!(shell_quote("/home/me/.ssh/id_ed25519"), "/home/me/.ssh/id_ed25519");
        assert_eq!(shell_quote("/a b/key"), "'/a b/key'");
    }

    #[test]
    fn paths_outside_repository_rejected() {
        let tmp = tempfile::TempDir::new().unwrap();
        let repo = tmp.path().join("repo");
        std::fs::create_dir_all(&repo).unwrap();
        let repo = std::fs::canonicalize(&repo).unwrap();

        assert!(resolve_within(&repo, Path::new("notes")).is_ok());
        assert!(resolve_within(&repo, Path::new("../elsewhere")).is_err());
    }
}
