use versql_common::{Error, Migration, Result, check_version};

/// Ordered upgrade path for a database.
///
/// Entries are kept in the order the caller supplied; nothing here sorts
/// them, so the catalog should already be in ascending version order.
/// Versions need not be contiguous.
#[derive(Debug, Clone, Default)]
pub struct MigrationCatalog {
    migrations: Vec<Migration>,
}

impl MigrationCatalog {
    pub fn new(migrations: Vec<Migration>) -> Self {
        Self { migrations }
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Migration> {
        self.migrations.iter()
    }

    pub fn versions(&self) -> Vec<u32> {
        self.migrations.iter().map(|m| m.version).collect()
    }

    pub fn highest_version(&self) -> Result<u32> {
        self.migrations
            .iter()
            .map(|m| m.version)
            .max()
            .ok_or(Error::EmptyCatalog)
    }

    /// Fails with `VersionOutOfRange` on the first version the engine cannot store.
    pub fn validate(&self) -> Result<()> {
        for migration in &self.migrations {
            check_version(migration.version)?;
        }
        Ok(())
    }

    /// Migrations with `current < version <= target`, in catalog order.
    pub fn applicable(&self, current: u32, target: u32) -> Vec<&Migration> {
        self.migrations
            .iter()
            .filter(|m| current < m.version && m.version <= target)
            .collect()
    }
}

impl From<Vec<Migration>> for MigrationCatalog {
    fn from(migrations: Vec<Migration>) -> Self {
        Self::new(migrations)
    }
}

impl FromIterator<Migration> for MigrationCatalog {
    fn from_iter<I: IntoIterator<Item = Migration>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::MigrationCatalog;
    use versql_common::{Error, Migration};

    fn catalog(versions: &[u32]) -> MigrationCatalog {
        versions
            .iter()
            .map(|v| Migration::new(*v, format!("CREATE TABLE t{v} (id INTEGER)")))
            .collect()
    }

    fn applied(catalog: &MigrationCatalog, current: u32, target: u32) -> Vec<u32> {
        catalog
            .applicable(current, target)
            .into_iter()
            .map(|m| m.version)
            .collect()
    }

    #[test]
    fn highest_version_is_the_maximum_not_the_last() {
        assert_eq!(catalog(&[1, 5, 3]).highest_version().ok(), Some(5));
    }

    #[test]
    fn empty_catalog_has_no_highest_version() {
        let err = MigrationCatalog::default()
            .highest_version()
            .expect_err("empty catalog should fail");
        assert!(matches!(err, Error::EmptyCatalog));
    }

    #[test]
    fn range_is_open_below_and_closed_above() {
        let catalog = catalog(&[1, 2, 4, 7]);
        assert_eq!(applied(&catalog, 0, 7), vec![1, 2, 4, 7]);
        assert_eq!(applied(&catalog, 1, 4), vec![2, 4]);
        assert_eq!(applied(&catalog, 2, 3), Vec::<u32>::new());
        assert_eq!(applied(&catalog, 3, 6), vec![4]);
    }

    #[test]
    fn validate_rejects_unstorable_versions() {
        assert!(catalog(&[1, 2, i32::MAX as u32]).validate().is_ok());

        let err = catalog(&[1, 3_000_000_000])
            .validate()
            .expect_err("version past i32::MAX should be rejected");
        assert!(matches!(err, Error::VersionOutOfRange(3_000_000_000)));
    }

    #[test]
    fn equal_versions_select_nothing() {
        let catalog = catalog(&[1, 2, 3]);
        for version in 0..=3 {
            assert!(catalog.applicable(version, version).is_empty());
        }
    }

    #[test]
    fn catalog_order_is_preserved() {
        let catalog = catalog(&[3, 1, 2]);
        assert_eq!(applied(&catalog, 0, 3), vec![3, 1, 2]);
        assert_eq!(catalog.versions(), vec![3, 1, 2]);
    }

    #[test]
    fn every_pair_selects_exactly_the_half_open_range() {
        let versions = [1, 2, 3, 5, 8, 13];
        let catalog = catalog(&versions);
        for current in 0..=13 {
            for target in current..=13 {
                let expected: Vec<u32> = versions
                    .iter()
                    .copied()
                    .filter(|v| current < *v && *v <= target)
                    .collect();
                assert_eq!(applied(&catalog, current, target), expected);
            }
        }
    }
}
