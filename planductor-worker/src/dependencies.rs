//! Dependency resolution: turning a task's planner, domain and problem
//! references into files on disk, fetching archives when the task names them.

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use planductor_common::TaskSpec;
use tempfile::TempDir;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::ExecutorSettings;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, thiserror::Error)]
pub enum DependencyError {
    #[error("dependency {url} unavailable: {reason}")]
    Unavailable { url: String, reason: String },
    #[error("failed to extract {archive}: {source}")]
    Extract {
        archive: String,
        #[source]
        source: io::Error,
    },
    #[error("{what} not found at {}", path.display())]
    Missing { what: &'static str, path: PathBuf },
    #[error("failed to create staging directory: {0}")]
    Staging(#[source] io::Error),
}

/// Source of dependency archives, addressed by path relative to a base.
#[async_trait]
pub trait DependencyFetcher: Send + Sync {
    async fn fetch(&self, relative: &str) -> Result<Vec<u8>, DependencyError>;
}

/// Fetches archives with `GET <base_url>/<relative>`.
pub struct HttpFetcher {
    client: reqwest::Client,
    base_url: String,
}

impl HttpFetcher {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, DependencyError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| DependencyError::Unavailable {
                url: base_url.to_string(),
                reason: err.to_string(),
            })?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn url_for(&self, relative: &str) -> String {
        format!("{}/{}", self.base_url, relative.trim_start_matches('/'))
    }
}

#[async_trait]
impl DependencyFetcher for HttpFetcher {
    async fn fetch(&self, relative: &str) -> Result<Vec<u8>, DependencyError> {
        let url = self.url_for(relative);
        let unavailable = |err: reqwest::Error| DependencyError::Unavailable {
            url: url.clone(),
            reason: err.to_string(),
        };

        debug!(%url, "Fetching dependency");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(unavailable)?
            .error_for_status()
            .map_err(unavailable)?;
        let body = response.bytes().await.map_err(unavailable)?;
        info!(%url, bytes = body.len(), "Dependency fetched");
        Ok(body.to_vec())
    }
}

/// Unpack a tar archive, gzip-compressed or not, into `dest`.
pub fn unpack_archive(bytes: &[u8], dest: &Path) -> io::Result<()> {
    let reader: Box<dyn Read + '_> = if bytes.starts_with(&GZIP_MAGIC) {
        Box::new(GzDecoder::new(bytes))
    } else {
        Box::new(bytes)
    };
    tar::Archive::new(reader).unpack(dest)
}

/// The `n`-th (1-based) regular file under `root` in name order, skipping
/// `exclude`.
pub fn nth_file(root: &Path, n: u32, exclude: &Path) -> Option<PathBuf> {
    let skip = usize::try_from(n.checked_sub(1)?).ok()?;
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file() && entry.path() != exclude)
        .map(|entry| entry.into_path())
        .nth(skip)
}

/// Absolute, existing paths for one task. Holds the staging directory the
/// archives were unpacked into, removed when this is dropped.
#[derive(Debug)]
pub struct ResolvedTask {
    pub planner: PathBuf,
    pub domain: PathBuf,
    pub problem: PathBuf,
    pub staging: Option<TempDir>,
}

impl ResolvedTask {
    /// Directory the planner is run from.
    pub fn planner_dir(&self) -> &Path {
        self.planner.parent().unwrap_or_else(|| Path::new("/"))
    }

    pub fn cleanup(self) {
        if let Some(staging) = self.staging {
            let path = staging.path().to_path_buf();
            if let Err(err) = staging.close() {
                warn!(dir = %path.display(), "Failed to remove staging directory: {}", err);
            }
        }
    }
}

pub struct DependencyResolver {
    fetcher: Option<Arc<dyn DependencyFetcher>>,
    planner_root: PathBuf,
    benchmark_root: PathBuf,
    work_root: PathBuf,
}

impl DependencyResolver {
    pub fn new(settings: &ExecutorSettings, fetcher: Option<Arc<dyn DependencyFetcher>>) -> Self {
        Self {
            fetcher,
            planner_root: settings.planner_root.clone(),
            benchmark_root: settings.benchmark_root.clone(),
            work_root: settings.work_root.clone(),
        }
    }

    pub async fn resolve(&self, task: &TaskSpec) -> Result<ResolvedTask, DependencyError> {
        let staging = if task.planner_url.is_some() || task.domain_url.is_some() {
            tokio::fs::create_dir_all(&self.work_root)
                .await
                .map_err(DependencyError::Staging)?;
            let dir = tempfile::Builder::new()
                .prefix("planductor-deps-")
                .tempdir_in(&self.work_root)
                .map_err(DependencyError::Staging)?;
            Some(dir)
        } else {
            None
        };
        let staging_path = staging.as_ref().map(|dir| dir.path().to_path_buf());

        let planner_base = match (&task.planner_url, &staging_path) {
            (Some(url), Some(staging)) => self.fetch_into(url, &staging.join("planner")).await?,
            _ => self.planner_root.clone(),
        };
        let planner = existing("planner", planner_base.join(&task.planner)).await?;

        let (domain, problem) = match (&task.domain_url, &staging_path) {
            (Some(url), Some(staging)) => {
                let base = self.fetch_into(url, &staging.join("domain")).await?;
                let domain = existing("domain", base.join(&task.domain)).await?;
                let problem = match task.problem_index {
                    Some(index) => nth_file(&base, index, &domain).ok_or_else(|| {
                        DependencyError::Missing {
                            what: "problem",
                            path: base.clone(),
                        }
                    })?,
                    None => base.join(&task.problem),
                };
                (domain, existing("problem", problem).await?)
            }
            _ => {
                if task.problem_index.is_some() {
                    warn!(task_id = %task.name, "problem_index ignored without domain_url");
                }
                (
                    existing("domain", self.benchmark_root.join(&task.domain)).await?,
                    existing("problem", self.benchmark_root.join(&task.problem)).await?,
                )
            }
        };

        debug!(
            task_id = %task.name,
            planner = %planner.display(),
            domain = %domain.display(),
            problem = %problem.display(),
            "Dependencies resolved"
        );
        Ok(ResolvedTask {
            planner,
            domain,
            problem,
            staging,
        })
    }

    async fn fetch_into(&self, relative: &str, dest: &Path) -> Result<PathBuf, DependencyError> {
        let fetcher = self
            .fetcher
            .as_ref()
            .ok_or_else(|| DependencyError::Unavailable {
                url: relative.to_string(),
                reason: "no dependency base_url configured".into(),
            })?;
        let bytes = fetcher.fetch(relative).await?;

        let target = dest.to_path_buf();
        let extract = |source| DependencyError::Extract {
            archive: relative.to_string(),
            source,
        };
        tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&target)?;
            unpack_archive(&bytes, &target)
        })
        .await
        .map_err(|err| extract(io::Error::new(io::ErrorKind::Other, err)))?
        .map_err(extract)?;
        existing("unpacked archive", dest.to_path_buf()).await
    }
}

async fn existing(what: &'static str, path: PathBuf) -> Result<PathBuf, DependencyError> {
    tokio::fs::canonicalize(&path)
        .await
        .map_err(|_| DependencyError::Missing { what, path })
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::collections::HashMap;
    use std::fs;
    use std::io::Write;

    struct StaticFetcher {
        archives: HashMap<String, Vec<u8>>,
    }

    #[async_trait]
    impl DependencyFetcher for StaticFetcher {
        async fn fetch(&self, relative: &str) -> Result<Vec<u8>, DependencyError> {
            self.archives
                .get(relative)
                .cloned()
                .ok_or_else(|| DependencyError::Unavailable {
                    url: relative.to_string(),
                    reason: "404 Not Found".into(),
                })
        }
    }

    fn tarball(files: &[(&str, &str)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, body) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(body.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder.append_data(&mut header, name, body.as_bytes()).unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn gzip(bytes: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(bytes).unwrap();
        encoder.finish().unwrap()
    }

    fn task() -> TaskSpec {
        TaskSpec {
            name: "T1".into(),
            planner: "bsg001/plan".into(),
            domain: "city/domain.pddl".into(),
            problem: "city/deliveries1.pddl".into(),
            duration_secs: 30,
            planner_url: None,
            domain_url: None,
            problem_index: None,
        }
    }

    fn settings(root: &Path) -> ExecutorSettings {
        ExecutorSettings {
            work_root: root.join("work"),
            planner_root: root.join("planners"),
            benchmark_root: root.join("benchmarks"),
            ..ExecutorSettings::default()
        }
    }

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, "x").unwrap();
    }

    #[tokio::test]
    async fn local_paths_resolve_under_configured_roots() {
        let root = tempfile::tempdir().unwrap();
        touch(&root.path().join("planners/bsg001/plan"));
        touch(&root.path().join("benchmarks/city/domain.pddl"));
        touch(&root.path().join("benchmarks/city/deliveries1.pddl"));

        let resolver = DependencyResolver::new(&settings(root.path()), None);
        let resolved = resolver.resolve(&task()).await.unwrap();

        assert!(resolved.staging.is_none());
        assert!(resolved.planner.ends_with("planners/bsg001/plan"));
        assert!(resolved.planner_dir().ends_with("planners/bsg001"));
        assert!(resolved.problem.ends_with("city/deliveries1.pddl"));
        assert!(resolved.domain.is_absolute());
    }

    #[tokio::test]
    async fn missing_local_file_is_reported() {
        let root = tempfile::tempdir().unwrap();
        touch(&root.path().join("planners/bsg001/plan"));

        let resolver = DependencyResolver::new(&settings(root.path()), None);
        let err = resolver.resolve(&task()).await.unwrap_err();
        assert!(matches!(err, DependencyError::Missing { what: "domain", .. }));
    }

    #[tokio::test]
    async fn archives_are_fetched_and_unpacked_into_staging() {
        let root = tempfile::tempdir().unwrap();
        let mut archives = HashMap::new();
        archives.insert(
            "planners/bsg001.tar.gz".to_string(),
            gzip(&tarball(&[("bsg001/plan", "#!/bin/sh\n")])),
        );
        archives.insert(
            "domains/city.tar".to_string(),
            tarball(&[
                ("city/domain.pddl", "(define (domain city))"),
                ("city/p01.pddl", "(define (problem p01))"),
                ("city/p02.pddl", "(define (problem p02))"),
            ]),
        );
        let fetcher: Arc<dyn DependencyFetcher> = Arc::new(StaticFetcher { archives });
        let resolver = DependencyResolver::new(&settings(root.path()), Some(fetcher));

        let spec = TaskSpec {
            planner_url: Some("planners/bsg001.tar.gz".into()),
            domain_url: Some("domains/city.tar".into()),
            problem_index: Some(2),
            ..task()
        };
        let resolved = resolver.resolve(&spec).await.unwrap();

        let staging = resolved.staging.as_ref().unwrap().path().to_path_buf();
        assert!(staging.starts_with(root.path().join("work")));
        assert!(resolved.planner.ends_with("planner/bsg001/plan"));
        assert!(resolved.domain.ends_with("domain/city/domain.pddl"));
        assert!(resolved.problem.ends_with("domain/city/p02.pddl"));

        resolved.cleanup();
        assert!(!staging.exists());
    }

    #[tokio::test]
    async fn problem_index_past_the_end_is_missing() {
        let root = tempfile::tempdir().unwrap();
        touch(&root.path().join("planners/bsg001/plan"));
        let mut archives = HashMap::new();
        archives.insert(
            "domains/city.tar".to_string(),
            tarball(&[
                ("city/domain.pddl", "(define (domain city))"),
                ("city/p01.pddl", "(define (problem p01))"),
            ]),
        );
        let fetcher: Arc<dyn DependencyFetcher> = Arc::new(StaticFetcher { archives });
        let resolver = DependencyResolver::new(&settings(root.path()), Some(fetcher));

        let spec = TaskSpec {
            domain_url: Some("domains/city.tar".into()),
            problem_index: Some(2),
            ..task()
        };
        let err = resolver.resolve(&spec).await.unwrap_err();
        assert!(matches!(err, DependencyError::Missing { what: "problem", .. }));
    }

    #[tokio::test]
    async fn fetch_failure_is_unavailable_and_staging_is_removed() {
        let root = tempfile::tempdir().unwrap();
        let fetcher: Arc<dyn DependencyFetcher> = Arc::new(StaticFetcher {
            archives: HashMap::new(),
        });
        let resolver = DependencyResolver::new(&settings(root.path()), Some(fetcher));

        let spec = TaskSpec {
            planner_url: Some("planners/missing.tar".into()),
            ..task()
        };
        let err = resolver.resolve(&spec).await.unwrap_err();
        assert!(matches!(err, DependencyError::Unavailable { .. }));
        let leftovers = fs::read_dir(root.path().join("work")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn garbage_archive_is_an_extract_error() {
        let root = tempfile::tempdir().unwrap();
        let mut archives = HashMap::new();
        archives.insert("planners/bsg001.tar".to_string(), vec![0x1f, 0x8b, 0, 1, 2, 3]);
        let fetcher: Arc<dyn DependencyFetcher> = Arc::new(StaticFetcher { archives });
        let resolver = DependencyResolver::new(&settings(root.path()), Some(fetcher));

        let spec = TaskSpec {
            planner_url: Some("planners/bsg001.tar".into()),
            ..task()
        };
        let err = resolver.resolve(&spec).await.unwrap_err();
        assert!(matches!(err, DependencyError::Extract { .. }));
    }

    #[test]
    fn url_joins_base_and_relative() {
        let fetcher =
            HttpFetcher::new("https://deps.example.org/bench/", Duration::from_secs(5)).unwrap();
        assert_eq!(
            fetcher.url_for("/planners/bsg001.tar"),
            "https://deps.example.org/bench/planners/bsg001.tar"
        );
    }

    #[test]
    fn nth_file_skips_the_domain_and_directories() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("a/domain.pddl"));
        touch(&dir.path().join("a/p1.pddl"));
        touch(&dir.path().join("b/p2.pddl"));
        let domain = dir.path().join("a/domain.pddl");

        assert_eq!(nth_file(dir.path(), 1, &domain), Some(dir.path().join("a/p1.pddl")));
        assert_eq!(nth_file(dir.path(), 2, &domain), Some(dir.path().join("b/p2.pddl")));
        assert_eq!(nth_file(dir.path(), 3, &domain), None);
        assert_eq!(nth_file(dir.path(), 0, &domain), None);
    }
}
