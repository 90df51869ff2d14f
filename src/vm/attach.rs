//! Resource exclusivity checks for disk, ISO and NIC attachment
//!
//! A disk or NIC may be listed by at most one guest at a time. ISOs are
//! read-only media and can be shared freely.

use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use super::handle::{Guest, GuestStatus};
use super::registry::GuestRegistry;
use crate::error::{EntityKind, Error, Result};
use crate::inventory::Inventory;

/// Which attachment list an operation targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttachKind {
    Disk,
    Iso,
    Nic,
}

impl AttachKind {
    pub fn entity(&self) -> EntityKind {
        match self {
            AttachKind::Disk => EntityKind::Disk,
            AttachKind::Iso => EntityKind::Iso,
            AttachKind::Nic => EntityKind::Nic,
        }
    }

    /// Whether one entity may belong to only one guest
    pub fn exclusive(&self) -> bool {
        !matches!(self, AttachKind::Iso)
    }
}

fn exists(inventory: &dyn Inventory, kind: AttachKind, id: &Uuid) -> Result<bool> {
    let name = match kind {
        AttachKind::Disk => inventory.disk(id)?.name,
        AttachKind::Iso => inventory.iso(id)?.name,
        AttachKind::Nic => inventory.nic(id)?.name,
    };
    Ok(!name.is_empty())
}

/// Validate a replacement attachment list for `target`.
///
/// Checks run in order and the first failure wins: target stopped, then
/// per candidate well-formed id, existence, no repeats, and for exclusive
/// kinds no other guest holding it. Nothing is modified.
pub fn validate_attachment(
    registry: &GuestRegistry,
    inventory: &dyn Inventory,
    candidates: &[String],
    target: &Guest,
    kind: AttachKind,
) -> Result<Vec<Uuid>> {
    if target.status() != GuestStatus::Stopped {
        return Err(Error::NotStopped(target.name().to_string()));
    }

    let entity = kind.entity();
    let owners: HashMap<Uuid, String> = if kind.exclusive() {
        registry
            .get_all()
            .into_iter()
            .filter(|g| g.id() != target.id())
            .flat_map(|g| {
                let name = g.name().to_string();
                g.snapshot()
                    .attachments(kind)
                    .iter()
                    .map(|id| (*id, name.clone()))
                    .collect::<Vec<_>>()
            })
            .collect()
    } else {
        HashMap::new()
    };

    let mut seen = HashSet::with_capacity(candidates.len());
    let mut ids = Vec::with_capacity(candidates.len());
    for raw in candidates {
        let id = Uuid::parse_str(raw.trim()).map_err(|_| Error::InvalidReference {
            kind: entity,
            id: raw.clone(),
        })?;
        if !exists(inventory, kind, &id)? {
            return Err(Error::NotFound {
                kind: entity,
                id: id.to_string(),
            });
        }
        if !seen.insert(id) {
            return Err(Error::DuplicateReference {
                kind: entity,
                id: id.to_string(),
            });
        }
        if let Some(owner) = owners.get(&id) {
            return Err(Error::AlreadyAttached {
                kind: entity,
                id: id.to_string(),
                guest: owner.clone(),
            });
        }
        ids.push(id);
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::{DiskInfo, IsoInfo, StaticInventory};
    use crate::store::MemoryStore;
    use crate::vm::config::GuestConfig;
    use std::sync::Arc;

    struct Fixture {
        registry: GuestRegistry,
        inventory: StaticInventory,
        disk: Uuid,
        iso: Uuid,
    }

    fn fixture() -> Fixture {
        let registry = GuestRegistry::new(Arc::new(MemoryStore::new()));
        let inventory = StaticInventory::new();
        let disk = Uuid::now_v7();
        let iso = Uuid::now_v7();
        inventory.insert_disk(
            disk,
            DiskInfo {
                name: "root".into(),
                path: "/dev/zvol/tank/root".into(),
                ..Default::default()
            },
        );
        inventory.insert_iso(
            iso,
            IsoInfo {
                name: "installer".into(),
                path: "/iso/installer.iso".into(),
            },
        );
        Fixture {
            registry,
            inventory,
            disk,
            iso,
        }
    }

    #[test]
    fn test_valid_list_keeps_order() {
        let f = fixture();
        let web = f.registry.create("web", GuestConfig::default()).unwrap();
        let ids = validate_attachment(
            &f.registry,
            &f.inventory,
            &[f.disk.to_string()],
            &web,
            AttachKind::Disk,
        )
        .unwrap();
        assert_eq!(ids, vec![f.disk]);
    }

    #[test]
    fn test_error_order_per_candidate() {
        let f = fixture();
        let web = f.registry.create("web", GuestConfig::default()).unwrap();

        let err = validate_attachment(&f.registry, &f.inventory, &["nope".into()], &web, AttachKind::Disk)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidReference { kind: EntityKind::Disk, .. }));

        let unknown = Uuid::now_v7().to_string();
        let err = validate_attachment(&f.registry, &f.inventory, &[unknown], &web, AttachKind::Disk)
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { kind: EntityKind::Disk, .. }));

        let twice = [f.disk.to_string(), f.disk.to_string()];
        let err = validate_attachment(&f.registry, &f.inventory, &twice, &web, AttachKind::Disk)
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateReference { .. }));
    }

    #[test]
    fn test_disk_owned_by_other_guest() {
        let f = fixture();
        let web = f.registry.create("web", GuestConfig::default()).unwrap();
        let db = f.registry.create("db", GuestConfig::default()).unwrap();
        db.transition(|s| {
            s.disks.push(f.disk);
            Ok(())
        })
        .unwrap();

        let err = validate_attachment(&f.registry, &f.inventory, &[f.disk.to_string()], &web, AttachKind::Disk)
            .unwrap_err();
        match err {
            Error::AlreadyAttached { guest, .. } => assert_eq!(guest, "db"),
            other => panic!("unexpected {other:?}"),
        }

        // re-validating the owner's own list is fine
        assert!(validate_attachment(&f.registry, &f.inventory, &[f.disk.to_string()], &db, AttachKind::Disk).is_ok());
    }

    #[test]
    fn test_iso_may_be_shared() {
        let f = fixture();
        let web = f.registry.create("web", GuestConfig::default()).unwrap();
        let db = f.registry.create("db", GuestConfig::default()).unwrap();
        db.transition(|s| {
            s.isos.push(f.iso);
            Ok(())
        })
        .unwrap();

        let ids = validate_attachment(&f.registry, &f.inventory, &[f.iso.to_string()], &web, AttachKind::Iso)
            .unwrap();
        assert_eq!(ids, vec![f.iso]);
    }

    #[test]
    fn test_target_must_be_stopped_first() {
        let f = fixture();
        let web = f.registry.create("web", GuestConfig::default()).unwrap();
        web.transition(|s| {
            s.status = GuestStatus::Starting;
            Ok(())
        })
        .unwrap();

        // NotStopped wins over the malformed reference
        let err = validate_attachment(&f.registry, &f.inventory, &["nope".into()], &web, AttachKind::Iso)
            .unwrap_err();
        assert!(matches!(err, Error::NotStopped(_)));
    }
}
