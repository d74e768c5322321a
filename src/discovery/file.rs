use super::{memory::StaticDirectory, BackendDirectory, DirectoryError, ServiceEndpoint};
use async_trait::async_trait;
use log::{error, warn};
use notify::{watcher, DebouncedEvent, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use std::{
  collections::HashMap,
  fmt, fs, io,
  path::{Path, PathBuf},
  sync::{mpsc::channel, Arc, Mutex},
  time::Duration,
};
use thiserror::Error;

const DEBOUNCE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ServicesFileError {
  #[error("failed to read services file {path}: {source}")]
  Read {
    path: String,
    #[source]
    source: io::Error,
  },
  #[error("failed to parse services file {path}: {source}")]
  Parse {
    path: String,
    #[source]
    source: toml::de::Error,
  },
  #[error("failed to watch services file: {0}")]
  Watch(#[from] notify::Error),
}

/// The `[services]` table: route name -> list of `host:port`
#[derive(Debug, Default, Deserialize)]
struct ServicesFile {
  #[serde(default)]
  services: HashMap<String, Vec<String>>,
}

impl ServicesFile {
  fn load(path: &Path) -> Result<ServicesFile, ServicesFileError> {
    let content = fs::read_to_string(path).map_err(|source| ServicesFileError::Read {
      path: path.display().to_string(),
      source,
    })?;
    toml::from_str(&content).map_err(|source| ServicesFileError::Parse {
      path: path.display().to_string(),
      source,
    })
  }
}

/// Directory backed by a TOML file which is reloaded whenever it is written to
pub struct FileDirectory {
  directory: Arc<StaticDirectory>,
  // dropping this would stop the reload thread
  _watcher: Mutex<RecommendedWatcher>,
}

impl fmt::Debug for FileDirectory {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("FileDirectory").field("directory", &self.directory).finish()
  }
}

impl FileDirectory {
  pub fn watch<P: AsRef<Path>>(path: P) -> Result<FileDirectory, ServicesFileError> {
    let path = path.as_ref().to_path_buf();
    let directory = Arc::new(StaticDirectory::new());
    directory.replace_all(ServicesFile::load(&path)?.services);

    let watcher = start_services_watcher(path, directory.clone())?;

    Ok(FileDirectory {
      directory,
      _watcher: Mutex::new(watcher),
    })
  }
}

fn start_services_watcher(path: PathBuf, directory: Arc<StaticDirectory>) -> Result<RecommendedWatcher, ServicesFileError> {
  let (tx, rx) = channel();
  let mut watcher = watcher(tx, DEBOUNCE)?;
  watcher.watch(&path, RecursiveMode::NonRecursive)?;

  std::thread::spawn(move || loop {
    match rx.recv() {
      Ok(DebouncedEvent::NoticeWrite(_)) | Ok(DebouncedEvent::Write(_)) | Ok(DebouncedEvent::Create(_)) => {
        match ServicesFile::load(&path) {
          Ok(file) => directory.replace_all(file.services),
          Err(e) => warn!("keeping previous services: {}", e),
        }
      }
      Ok(DebouncedEvent::Error(e, _)) => error!("Error occurred while watching services file: {}", e),
      Ok(_) => {}
      Err(_) => {
        directory.shutdown();
        return;
      }
    }
  });

  Ok(watcher)
}

#[async_trait]
impl BackendDirectory for FileDirectory {
  async fn find_endpoints(&self, route: &str, timeout: Duration) -> Result<Vec<ServiceEndpoint>, DirectoryError> {
    self.directory.find_endpoints(route, timeout).await
  }
}
