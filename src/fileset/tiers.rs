use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{Error, Result};

/// A directory chosen to hold a file-set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disk {
    pub level: u8,
    pub id: u32,
    pub dir: PathBuf,
}

/// Storage directories grouped by level, hottest first.
#[derive(Debug)]
pub struct Tiers {
    levels: Vec<Vec<PathBuf>>,
    cursors: Vec<AtomicUsize>,
}

impl Tiers {
    /// Creates every configured directory.
    pub fn open(levels: Vec<Vec<PathBuf>>) -> Result<Self> {
        for dir in levels.iter().flatten() {
            fs::create_dir_all(dir)?;
        }
        let cursors = levels.iter().map(|_| AtomicUsize::new(0)).collect();
        Ok(Self { levels, cursors })
    }

    /// Picks a directory on `level`, or on the closest hotter level that has
    /// one. Directories of a level are handed out round robin.
    pub fn alloc(&self, level: u8) -> Result<Disk> {
        let top = (level as usize + 1).min(self.levels.len());
        for lvl in (0..top).rev() {
            let dirs = &self.levels[lvl];
            if dirs.is_empty() {
                continue;
            }
            let id = self.cursors[lvl].fetch_add(1, Ordering::Relaxed) % dirs.len();
            return Ok(Disk {
                level: lvl as u8,
                id: id as u32,
                dir: dirs[id].clone(),
            });
        }
        Err(Error::NoAvailableStorage(level))
    }

    /// The level a requested level actually resolves to.
    pub fn effective_level(&self, level: u8) -> Option<u8> {
        let top = (level as usize + 1).min(self.levels.len());
        (0..top)
            .rev()
            .find(|lvl| !self.levels[*lvl].is_empty())
            .map(|lvl| lvl as u8)
    }

    pub fn dirs(&self) -> impl Iterator<Item = &Path> {
        self.levels.iter().flatten().map(PathBuf::as_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_round_robin_within_level() -> Result<()> {
        let root = TempDir::new()?;
        let a = root.path().join("a");
        let b = root.path().join("b");
        let tiers = Tiers::open(vec![vec![a.clone(), b.clone()]])?;
        assert!(a.is_dir() && b.is_dir());

        let picks: Vec<_> = (0..4).map(|_| tiers.alloc(0).map(|d| d.dir)).collect::<Result<_>>()?;
        assert_eq!(picks, vec![a.clone(), b.clone(), a, b]);
        Ok(())
    }

    #[test]
    fn test_falls_back_to_hotter_level() -> Result<()> {
        let root = TempDir::new()?;
        let hot = root.path().join("hot");
        let cold = root.path().join("cold");
        let tiers = Tiers::open(vec![vec![hot.clone()], vec![], vec![cold.clone()]])?;

        assert_eq!(tiers.alloc(1)?.dir, hot);
        assert_eq!(tiers.alloc(1)?.level, 0);
        assert_eq!(tiers.alloc(2)?.dir, cold);
        assert_eq!(tiers.alloc(9)?.level, 2);
        assert_eq!(tiers.effective_level(1), Some(0));
        assert_eq!(tiers.dirs().count(), 2);
        Ok(())
    }

    #[test]
    fn test_no_storage() -> Result<()> {
        let tiers = Tiers::open(vec![vec![]])?;
        assert!(matches!(tiers.alloc(0), Err(Error::NoAvailableStorage(0))));
        let tiers = Tiers::open(Vec::new())?;
        assert!(matches!(tiers.alloc(1), Err(Error::NoAvailableStorage(1))));
        Ok(())
    }
}
