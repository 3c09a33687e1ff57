//! Databases, resources and their sessions.
//!
//! A database is a directory of resources; a resource is one versioned
//! tree. The process-wide registry hands out a single shared instance
//! per database path. Opening a resource takes its exclusive lock file
//! for the lifetime of the session object, so a second process fails
//! with `ResourceLocked` while any transaction could still be live.

use crate::node_read_trx::NodeReadTrx;
use crate::node_write_trx::{NodeWriteTrx, WriteOptions};
use crate::{Error, Result};
use alderdb_storage::dewey::DeweyId;
use alderdb_storage::page::UberPage;
use alderdb_storage::read_trx::PageReadTrx;
use alderdb_storage::record::{
    DocumentNode, Node, NodeDelegate, NodeKind, PathNode, StructNodeDelegate,
};
use alderdb_storage::reference::TreeKind;
use alderdb_storage::resource::{
    DatabaseConfig, LockFile, ResourceConfig, resource_dir, resources_dir,
};
use alderdb_storage::store::{FileReader, FileWriter, Reader};
use alderdb_storage::write_trx::PageWriteTrx;
use alderdb_storage::{DOCUMENT_NODE_KEY, NULL_NODE_KEY};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

static REGISTRY: Lazy<Mutex<HashMap<PathBuf, Weak<DatabaseInner>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

pub struct Database {
    inner: Arc<DatabaseInner>,
}

pub(crate) struct DatabaseInner {
    dir: PathBuf,
    config: DatabaseConfig,
    resources: Mutex<HashMap<String, Weak<ResourceInner>>>,
}

impl Database {
    /// Creates the database directory (or opens it if it already holds
    /// one) and registers it process-wide.
    pub fn create(dir: impl AsRef<Path>) -> Result<Database> {
        let dir = dir.as_ref();
        fs::create_dir_all(resources_dir(dir)).map_err(alderdb_storage::Error::Io)?;
        if !dir.join(alderdb_storage::resource::DATABASE_CONFIG).exists() {
            let name = dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "database".to_string());
            DatabaseConfig::new(&name).save(dir)?;
        }
        Self::open(dir)
    }

    /// Opens an existing database, sharing the instance with any other
    /// opener of the same path in this process.
    pub fn open(dir: impl AsRef<Path>) -> Result<Database> {
        let dir = fs::canonicalize(dir.as_ref()).map_err(alderdb_storage::Error::Io)?;
        if !dir.join(alderdb_storage::resource::DATABASE_CONFIG).exists() {
            return Err(Error::Storage(alderdb_storage::Error::ResourceNotFound(
                dir.display().to_string(),
            )));
        }

        let mut registry = REGISTRY.lock().unwrap();
        if let Some(existing) = registry.get(&dir).and_then(Weak::upgrade) {
            return Ok(Database { inner: existing });
        }
        let config = DatabaseConfig::load(&dir)?;
        let inner = Arc::new(DatabaseInner {
            dir: dir.clone(),
            config,
            resources: Mutex::new(HashMap::new()),
        });
        registry.insert(dir, Arc::downgrade(&inner));
        Ok(Database { inner })
    }

    pub fn exists(dir: impl AsRef<Path>) -> bool {
        dir.as_ref()
            .join(alderdb_storage::resource::DATABASE_CONFIG)
            .exists()
    }

    /// Deletes a whole database directory. Fails with `ResourceLocked`
    /// while any of its resources is in use.
    pub fn drop_database(dir: impl AsRef<Path>) -> Result<()> {
        let dir = fs::canonicalize(dir.as_ref()).map_err(alderdb_storage::Error::Io)?;
        if !dir.join(alderdb_storage::resource::DATABASE_CONFIG).exists() {
            return Err(Error::Storage(alderdb_storage::Error::ResourceNotFound(
                dir.display().to_string(),
            )));
        }
        // Probe every resource lock before destroying anything.
        let resources = list_resource_names(&dir)?;
        let mut locks = Vec::new();
        for name in &resources {
            locks.push(LockFile::acquire(&resource_dir(&dir, name))?);
        }
        REGISTRY.lock().unwrap().remove(&dir);
        let result = fs::remove_dir_all(&dir);
        match result {
            Ok(()) => {
                // The lock files went away with the directory.
                for lock in locks {
                    std::mem::forget(lock);
                }
                Ok(())
            }
            Err(e) => Err(Error::Storage(alderdb_storage::Error::Io(e))),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.dir
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn id(&self) -> uuid::Uuid {
        self.inner.config.id
    }

    /// Creates and bootstraps a resource: revision 0 holds the document
    /// root and the path-summary root.
    pub fn create_resource(&self, name: &str, config: ResourceConfig) -> Result<()> {
        validate_resource_name(name)?;
        config.validate()?;
        let dir = resource_dir(&self.inner.dir, name);
        if dir.exists() {
            return Err(Error::Storage(alderdb_storage::Error::ResourceExists(
                name.to_string(),
            )));
        }
        fs::create_dir_all(&dir).map_err(alderdb_storage::Error::Io)?;
        config.save(&dir)?;
        bootstrap(&dir, &config)?;
        log::info!("created resource {name} in {}", self.inner.dir.display());
        Ok(())
    }

    /// Removes a resource; fails with `ResourceLocked` while in use.
    pub fn drop_resource(&self, name: &str) -> Result<()> {
        validate_resource_name(name)?;
        let dir = resource_dir(&self.inner.dir, name);
        if !dir.exists() {
            return Err(Error::Storage(alderdb_storage::Error::ResourceNotFound(
                name.to_string(),
            )));
        }
        let lock = LockFile::acquire(&dir)?;
        self.inner.resources.lock().unwrap().remove(name);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                std::mem::forget(lock);
                Ok(())
            }
            Err(e) => Err(Error::Storage(alderdb_storage::Error::Io(e))),
        }
    }

    pub fn list_resources(&self) -> Result<Vec<String>> {
        list_resource_names(&self.inner.dir)
    }

    /// Opens (or shares) the session for `name`.
    pub fn resource(&self, name: &str) -> Result<Resource> {
        validate_resource_name(name)?;
        let mut resources = self.inner.resources.lock().unwrap();
        if let Some(existing) = resources.get(name).and_then(Weak::upgrade) {
            return Ok(Resource { inner: existing });
        }
        let dir = resource_dir(&self.inner.dir, name);
        if !dir.exists() {
            return Err(Error::Storage(alderdb_storage::Error::ResourceNotFound(
                name.to_string(),
            )));
        }
        let inner = ResourceInner::open(dir, name.to_string())?;
        resources.insert(name.to_string(), Arc::downgrade(&inner));
        Ok(Resource { inner })
    }
}

fn list_resource_names(db_dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let dir = resources_dir(db_dir);
    if !dir.exists() {
        return Ok(names);
    }
    for entry in fs::read_dir(&dir).map_err(alderdb_storage::Error::Io)? {
        let entry = entry.map_err(alderdb_storage::Error::Io)?;
        if entry.path().join(alderdb_storage::resource::RESOURCE_CONFIG).exists() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

fn validate_resource_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name
            .chars()
            .any(|c| matches!(c, '/' | '\\') || c.is_control())
    {
        return Err(Error::Usage("invalid resource name"));
    }
    Ok(())
}

/// One versioned tree plus its session state.
pub struct Resource {
    inner: Arc<ResourceInner>,
}

pub(crate) struct ResourceInner {
    pub(crate) dir: PathBuf,
    pub(crate) name: String,
    pub(crate) config: ResourceConfig,
    uber: RwLock<Arc<UberPage>>,
    writer_claimed: AtomicBool,
    _lock: LockFile,
}

impl ResourceInner {
    fn open(dir: PathBuf, name: String) -> Result<Arc<Self>> {
        let config = ResourceConfig::load(&dir)?;
        // Discard any commit that never installed its uber page.
        alderdb_storage::store::recover(&dir)?;
        let lock = LockFile::acquire(&dir)?;

        let mut reader = FileReader::open(&dir)?;
        let uber_key = reader
            .read_uber_page_ref()?
            .storage_key()
            .ok_or(alderdb_storage::Error::Corrupted(
                "resource was never bootstrapped",
            ))?;
        let uber = Arc::new(reader.read(uber_key)?.as_uber()?.clone());

        Ok(Arc::new(Self {
            dir,
            name,
            config,
            uber: RwLock::new(uber),
            writer_claimed: AtomicBool::new(false),
            _lock: lock,
        }))
    }

    pub(crate) fn publish(&self, uber: Arc<UberPage>) {
        *self.uber.write().unwrap() = uber;
    }

    pub(crate) fn current_uber(&self) -> Arc<UberPage> {
        self.uber.read().unwrap().clone()
    }

    pub(crate) fn release_writer(&self) {
        self.writer_claimed.store(false, Ordering::SeqCst);
    }
}

impl Resource {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &ResourceConfig {
        &self.inner.config
    }

    pub fn latest_revision(&self) -> Option<u32> {
        self.inner.current_uber().latest_revision()
    }

    /// Read transaction bound to the latest committed revision.
    pub fn begin_read(&self) -> Result<NodeReadTrx> {
        self.begin_read_impl(None)
    }

    /// Read transaction bound to `revision`.
    pub fn begin_read_at(&self, revision: u32) -> Result<NodeReadTrx> {
        self.begin_read_impl(Some(revision))
    }

    fn begin_read_impl(&self, revision: Option<u32>) -> Result<NodeReadTrx> {
        let reader = Box::new(FileReader::open(&self.inner.dir)?);
        let pages = PageReadTrx::open(
            reader,
            self.inner.current_uber(),
            revision,
            self.inner.config.clone(),
        )?;
        NodeReadTrx::new(pages, self.inner.clone())
    }

    /// Write transaction with default options; at most one may exist per
    /// resource.
    pub fn begin_write(&self) -> Result<NodeWriteTrx> {
        self.begin_write_with(WriteOptions::default())
    }

    pub fn begin_write_with(&self, options: WriteOptions) -> Result<NodeWriteTrx> {
        if self
            .inner
            .writer_claimed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::WriterBusy);
        }
        match self.open_writer(options) {
            Ok(trx) => Ok(trx),
            Err(e) => {
                self.inner.release_writer();
                Err(e)
            }
        }
    }

    fn open_writer(&self, options: WriteOptions) -> Result<NodeWriteTrx> {
        let writer = Box::new(FileWriter::open(&self.inner.dir)?);
        let reader = Box::new(FileReader::open(&self.inner.dir)?);
        let pages = PageWriteTrx::open(
            reader,
            writer,
            self.inner.current_uber(),
            self.inner.config.clone(),
        )?;
        NodeWriteTrx::new(pages, self.inner.clone(), options)
    }
}

/// Commits revision 0: the document root record and the path-summary
/// root.
fn bootstrap(dir: &Path, config: &ResourceConfig) -> Result<()> {
    let writer = Box::new(FileWriter::open(dir)?);
    let reader = Box::new(FileReader::open(dir)?);
    let mut trx = PageWriteTrx::open(
        reader,
        writer,
        Arc::new(UberPage::new_bootstrap()),
        config.clone(),
    )?;

    let mut del = NodeDelegate::new(DOCUMENT_NODE_KEY, NULL_NODE_KEY);
    if config.use_dewey_ids {
        del.dewey = Some(DeweyId::document_root());
    }
    trx.create_entry(
        Node::Document(DocumentNode {
            del,
            structure: StructNodeDelegate::empty(),
        }),
        TreeKind::Document,
    )?;
    trx.create_entry(
        Node::Path(PathNode {
            del: NodeDelegate::new(0, NULL_NODE_KEY),
            structure: StructNodeDelegate::empty(),
            referenced_kind: NodeKind::Document,
            prefix_key: -1,
            local_name_key: -1,
            uri_key: -1,
            references: 0,
            level: 0,
        }),
        TreeKind::PathSummary,
    )?;
    trx.commit()?;
    trx.close()?;
    Ok(())
}
