use std::fs;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::block::DataCols;
use crate::commit::{delete, CommitStats, Committer};
use crate::config::CommitConfig;
use crate::error::{Error, Result};
use crate::fileset::catalog::Catalog;
use crate::fileset::{fid_of, Fid, FileSet, FileSetManager, FileSetReader, Tiers};
use crate::flock::FileLock;
use crate::row::{Cell, DeleteOp, Key, Row, TableId};
use crate::schema::SchemaSource;
use crate::state::UnitState;

/// A time-series storage unit: write buffers, file-sets and the commit
/// engine that moves rows from the first to the second.
pub struct Tsdb {
    config: CommitConfig,
    _lock: FileLock,
    schemas: Arc<dyn SchemaSource>,
    state: UnitState,
    commit_lock: Mutex<()>,
    manager: FileSetManager,
}

impl Tsdb {
    /// Opens or creates the storage unit at `config.dir`.
    ///
    /// Files left behind by a commit that never reached the catalog are
    /// deleted.
    pub fn open(config: CommitConfig, schemas: Arc<dyn SchemaSource>) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.dir)?;
        let lock = FileLock::acquire(&config.dir)?;

        let tiers = Tiers::open(config.resolved_tiers())?;
        let catalog = Arc::new(Catalog::open(&config.dir, config.catalog_snapshot_interval)?);
        let manager = FileSetManager::new(tiers, catalog, config.last_file_threshold);
        let orphans = manager.remove_orphans()?;

        tracing::info!(
            dir = %config.dir.display(),
            filesets = manager.catalog().filesets()?.len(),
            orphans = orphans,
            "storage unit opened"
        );
        Ok(Self {
            config,
            _lock: lock,
            schemas,
            state: UnitState::new(),
            commit_lock: Mutex::new(()),
            manager,
        })
    }

    pub fn config(&self) -> &CommitConfig {
        &self.config
    }

    fn partition_of(&self, key: Key) -> Result<Fid> {
        fid_of(key, self.config.partition_width)
    }

    /// Buffers a row written with the table's latest schema.
    pub fn insert(&self, table: TableId, key: Key, cells: Vec<Cell>) -> Result<()> {
        self.partition_of(key)?;
        let schema = self.schemas.resolve(table, None)?;
        schema.check_cells(&cells)?;
        let mut row = Row::put(key, schema.version, cells);
        self.state.write(|active, version| {
            row.version = version;
            active.put(table, row)
        })
    }

    /// Buffers a tombstone for one key.
    pub fn delete_row(&self, table: TableId, key: Key) -> Result<()> {
        self.partition_of(key)?;
        let mut row = Row::delete(key);
        self.state.write(|active, version| {
            row.version = version;
            active.put(table, row)
        })
    }

    /// Records a delete of the keys `[start_key, end_key]` of `table`.
    pub fn delete_range(&self, table: TableId, start_key: Key, end_key: Key) -> Result<()> {
        if start_key > end_key {
            return Err(Error::InvalidOperation(format!(
                "delete range [{}, {}] is empty",
                start_key, end_key
            )));
        }
        self.state.write(|active, version| {
            let op = DeleteOp {
                version,
                start_key,
                end_key,
            };
            active.delete_range(table, op)
        })
    }

    /// Commits buffered writes with retention evaluated at the current time.
    pub fn commit(&self) -> Result<CommitStats> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| Error::InvalidState(format!("clock before epoch: {}", e)))?;
        self.commit_at(now.as_millis() as Key)
    }

    /// Commits buffered writes with retention evaluated at `now`.
    ///
    /// A snapshot left frozen by a failed commit is committed first, and
    /// the rows written since stay buffered.
    pub fn commit_at(&self, now: Key) -> Result<CommitStats> {
        let _guard = self.commit_lock.lock()?;
        let mut committer = Committer::new(
            &self.config,
            self.schemas.as_ref(),
            &self.manager,
            &self.state,
            now,
        );
        match self.state.frozen()? {
            Some(frozen) => committer.resume(frozen)?,
            None => committer.start()?,
        }
        committer.run()
    }

    pub fn fileset(&self, fid: Fid) -> Result<Option<Arc<FileSet>>> {
        self.manager.catalog().get(fid)
    }

    pub fn filesets(&self) -> Result<Vec<Arc<FileSet>>> {
        self.manager.catalog().filesets()
    }

    /// Every committed row of `table` in key order, decoded with its latest
    /// schema.
    pub fn read_table(&self, table: TableId) -> Result<DataCols> {
        let schema = self.schemas.resolve(table, None)?;
        let mut out = DataCols::new(&schema);
        for set in self.filesets()? {
            let reader = FileSetReader::open(set)?;
            let idxs = reader.load_block_idx()?;
            let Ok(pos) = idxs.binary_search_by(|idx| idx.table.cmp(&table)) else {
                continue;
            };
            for entry in reader.load_block_info(&idxs[pos])?.entries {
                let cols = reader.load_block(&entry, &schema)?;
                for i in 0..cols.rows() {
                    out.push_from(&cols, i)?;
                }
            }
        }
        Ok(out)
    }

    /// Committed delete ranges of `table`.
    pub fn delete_ranges(&self, table: TableId) -> Result<Vec<DeleteOp>> {
        delete::delete_ranges(self.manager.catalog(), table)
    }
}
