//! Directory operations — mkdir, rmdir, rename, ensure-exists, subtree removal.
//!
//! The recursive operations are plain sequences of single commands; each
//! step waits for its reply before the next one is sent, and nothing is
//! rolled back when a step fails.

use crate::ftp::client::FtpClient;
use crate::ftp::error::FtpResult;

impl FtpClient {
    // ─── MKD ─────────────────────────────────────────────────────

    /// Create a directory on the remote server.
    ///
    /// Returns the path reported in the `257` reply, or `path` when the
    /// server did not quote one.
    pub async fn mkdir(&mut self, path: &str) -> FtpResult<String> {
        let resp = self
            .control
            .send(&format!("MKD {}", path), false)
            .await
            .map_err(|e| e.with_path(path))?;
        self.touch();
        let text = &resp.message;
        if let Some(start) = text.find('"') {
            if let Some(end) = text[start + 1..].find('"') {
                return Ok(text[start + 1..start + 1 + end].to_string());
            }
        }
        Ok(path.to_string())
    }

    /// Make sure `path` and all its parents exist.
    ///
    /// Each level is probed with CWD and created with MKD only when the
    /// probe fails, parents first. A failed MKD on a directory that turns
    /// out to exist (another client created it meanwhile) counts as
    /// success. The working directory is restored afterwards.
    pub async fn ensure_exists(&mut self, path: &str) -> FtpResult<()> {
        let target = normalize_path(&self.info.current_directory, path);
        let original = self.info.current_directory.clone();

        let result = self.ensure_dir(&target).await;

        if let Err(e) = self.control.send(&format!("CWD {}", original), false).await {
            log::warn!("FTP could not return to {} after ensure_exists: {}", original, e);
        }
        self.touch();
        result
    }

    async fn ensure_dir(&mut self, dir: &str) -> FtpResult<()> {
        if dir == "/" {
            return Ok(());
        }

        match self.control.send(&format!("CWD {}", dir), false).await {
            Ok(_) => return Ok(()),
            Err(e) if e.is_rejected() => {}
            Err(e) => return Err(e.with_path(dir)),
        }

        Box::pin(self.ensure_dir(parent_of(dir))).await?;

        match self.control.send(&format!("MKD {}", dir), false).await {
            Ok(_) => {
                log::debug!("FTP created directory {}", dir);
                Ok(())
            }
            Err(mkd) if mkd.is_rejected() => {
                match self.control.send(&format!("CWD {}", dir), false).await {
                    Ok(_) => {
                        log::debug!("FTP directory {} appeared concurrently", dir);
                        Ok(())
                    }
                    Err(_) => Err(mkd.with_path(dir)),
                }
            }
            Err(e) => Err(e.with_path(dir)),
        }
    }

    // ─── RMD ─────────────────────────────────────────────────────

    /// Remove an empty directory.
    pub async fn rmdir(&mut self, path: &str) -> FtpResult<()> {
        self.control
            .send(&format!("RMD {}", path), false)
            .await
            .map_err(|e| e.with_path(path))?;
        self.touch();
        Ok(())
    }

    /// Recursively remove a directory and all its contents.
    ///
    /// Sub-directories are removed depth-first. A file that cannot be
    /// deleted is logged and skipped; the final RMD then reports the
    /// directory as non-empty.
    pub async fn remove_subtree(&mut self, path: &str) -> FtpResult<()> {
        let entries = self.list(Some(path)).await?;

        for entry in entries {
            let full_path = join_path(path, &entry.name);
            if entry.is_dir() {
                Box::pin(self.remove_subtree(&full_path)).await?;
            } else if let Err(e) = self.delete(&full_path).await {
                log::warn!("FTP could not delete {} during subtree removal: {}", full_path, e);
            }
        }

        self.rmdir(path).await
    }

    // ─── RNFR / RNTO ────────────────────────────────────────────

    /// Rename (or move) a file or directory.
    pub async fn rename(&mut self, from: &str, to: &str) -> FtpResult<()> {
        self.control
            .send(&format!("RNFR {}", from), false)
            .await
            .map_err(|e| e.with_path(from))?;
        self.control
            .send(&format!("RNTO {}", to), false)
            .await
            .map_err(|e| e.with_path(to))?;
        self.touch();
        Ok(())
    }

    // ─── DELE ────────────────────────────────────────────────────

    /// Delete a remote file.
    pub async fn delete(&mut self, path: &str) -> FtpResult<()> {
        self.control
            .send(&format!("DELE {}", path), false)
            .await
            .map_err(|e| e.with_path(path))?;
        self.touch();
        Ok(())
    }

    // ─── SITE CHMOD ─────────────────────────────────────────────

    /// Change file permissions via SITE CHMOD (common but not standard).
    pub async fn chmod(&mut self, path: &str, mode: &str) -> FtpResult<()> {
        self.control
            .send(&format!("SITE CHMOD {} {}", mode, path), false)
            .await
            .map_err(|e| e.with_path(path))?;
        self.touch();
        Ok(())
    }
}

// ─── Path helpers ────────────────────────────────────────────────────

/// Resolve `path` against `cwd` into an absolute path without `.`/`..`.
fn normalize_path(cwd: &str, path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    let joined = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{}/{}", cwd, path)
    };
    for seg in joined.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }
    format!("/{}", segments.join("/"))
}

fn parent_of(dir: &str) -> &str {
    match dir.rfind('/') {
        Some(0) | None => "/",
        Some(pos) => &dir[..pos],
    }
}

fn join_path(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}
