use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::Utc;
use lineout_ingest::{FolderRecord, MetadataStore};
use serde::Serialize;
use tracing::{info, warn};

use crate::drive::{children_query, DriveApi, DriveFile};

/// Drive's alias for the user's My Drive root.
const MY_DRIVE: &str = "root";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FolderNode {
    pub id: String,
    pub name: String,
    pub path: String,
    pub depth: u32,
    pub children: Vec<FolderNode>,
}

/// A non-folder file found under the watched tree.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredFile {
    pub file: DriveFile,
    pub folder_id: Option<String>,
    pub folder_path: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DiscoveryResult {
    pub files: Vec<DiscoveredFile>,
    pub folders: Vec<FolderRecord>,
    pub tree: FolderNode,
    /// Folders not descended into (already visited or past `max_depth`).
    pub skipped_folders: usize,
}

pub(crate) fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Root-level files have an empty path, which is reported as `None`.
pub(crate) fn display_path(path: &str) -> Option<String> {
    Some(path.to_string()).filter(|p| !p.is_empty())
}

pub struct DocumentDiscovery {
    drive: Arc<dyn DriveApi>,
    store: Arc<dyn MetadataStore>,
    root_folder_id: Option<String>,
    max_depth: u32,
}

impl DocumentDiscovery {
    pub fn new(
        drive: Arc<dyn DriveApi>,
        store: Arc<dyn MetadataStore>,
        root_folder_id: Option<String>,
        max_depth: u32,
    ) -> Self {
        Self {
            drive,
            store,
            root_folder_id,
            max_depth,
        }
    }

    /// Breadth-first walk of the watched tree. Folder records are persisted.
    pub async fn discover(&self) -> Result<DiscoveryResult> {
        let root_alias = self.root_folder_id.as_deref().unwrap_or(MY_DRIVE);
        let root = self
            .drive
            .get_file(root_alias)
            .await?
            .ok_or_else(|| anyhow!("root folder {} not found or not shared", root_alias))?;
        if !root.is_folder() {
            return Err(anyhow!("{} ({}) is not a folder", root.name, root.id));
        }

        let now = Utc::now();
        let root_record = FolderRecord {
            id: None,
            google_drive_id: root.id.clone(),
            name: root.name.clone(),
            parent_id: None,
            path: String::new(),
            depth: 0,
            updated_at: now,
        };

        let mut visited: HashSet<String> = HashSet::from([root.id.clone()]);
        let mut seen_files: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<FolderRecord> = VecDeque::from([root_record.clone()]);
        let mut folders = vec![root_record];
        let mut files = Vec::new();
        let mut skipped_folders = 0;

        while let Some(folder) = queue.pop_front() {
            let children = self
                .drive
                .list_files(&children_query(&folder.google_drive_id))
                .await?;
            for child in children {
                if child.is_folder() {
                    if !visited.insert(child.id.clone()) {
                        warn!("Folder {} reached twice, skipping", child.id);
                        skipped_folders += 1;
                        continue;
                    }
                    if folder.depth + 1 > self.max_depth {
                        warn!("Folder {} is deeper than {}, skipping", child.name, self.max_depth);
                        skipped_folders += 1;
                        continue;
                    }
                    let record = FolderRecord {
                        id: None,
                        google_drive_id: child.id.clone(),
                        name: child.name.clone(),
                        parent_id: Some(folder.google_drive_id.clone()),
                        path: join_path(&folder.path, &child.name),
                        depth: folder.depth + 1,
                        updated_at: now,
                    };
                    folders.push(record.clone());
                    queue.push_back(record);
                } else if seen_files.insert(child.id.clone()) {
                    files.push(DiscoveredFile {
                        file: child,
                        folder_id: Some(folder.google_drive_id.clone()),
                        folder_path: display_path(&folder.path),
                    });
                }
            }
        }

        for folder in &folders {
            self.store.upsert_folder(folder).await?;
        }
        info!(
            "Discovered {} files in {} folders under {}",
            files.len(),
            folders.len(),
            root.name
        );

        let tree = build_tree(&folders);
        Ok(DiscoveryResult {
            files,
            folders,
            tree,
            skipped_folders,
        })
    }
}

/// Assemble the nested tree; `folders[0]` is the root.
fn build_tree(folders: &[FolderRecord]) -> FolderNode {
    let mut by_parent: HashMap<&str, Vec<&FolderRecord>> = HashMap::new();
    for folder in folders.iter().skip(1) {
        if let Some(parent) = folder.parent_id.as_deref() {
            by_parent.entry(parent).or_default().push(folder);
        }
    }

    fn node(folder: &FolderRecord, by_parent: &HashMap<&str, Vec<&FolderRecord>>) -> FolderNode {
        let children = by_parent
            .get(folder.google_drive_id.as_str())
            .map(|kids| kids.iter().map(|k| node(k, by_parent)).collect())
            .unwrap_or_default();
        FolderNode {
            id: folder.google_drive_id.clone(),
            name: folder.name.clone(),
            path: folder.path.clone(),
            depth: folder.depth,
            children,
        }
    }

    match folders.first() {
        Some(root) => node(root, &by_parent),
        None => FolderNode {
            id: String::new(),
            name: String::new(),
            path: String::new(),
            depth: 0,
            children: Vec::new(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_drive::{file, folder, FakeDrive};
    use lineout_ingest::MemoryStore;

    fn team_drive() -> Arc<FakeDrive> {
        let drive = FakeDrive::new();
        drive.add_folder(folder("root", "Club", None));
        drive.add_folder(folder("coaching", "Coaching", Some("root")));
        drive.add_folder(folder("drills", "Drills", Some("coaching")));
        drive.add_file(file("plan", "Season plan", "text/plain", "root", "2024-03-01T10:00:00Z"), "plan");
        drive.add_file(file("d1", "Lineout drill", "text/plain", "drills", "2024-03-02T10:00:00Z"), "d1");
        drive.add_file(file("d2", "Maul drill", "text/plain", "drills", "2024-03-02T11:00:00Z"), "d2");
        drive.add_file(file("d3", "Scrum drill", "text/plain", "drills", "2024-03-02T12:00:00Z"), "d3");
        Arc::new(drive)
    }

    #[tokio::test]
    async fn test_walks_tree_and_persists_folders() {
        let drive = team_drive();
        let store = Arc::new(MemoryStore::new());
        let discovery = DocumentDiscovery::new(drive, store.clone(), Some("root".into()), 10);

        let result = discovery.discover().await.unwrap();
        assert_eq!(result.files.len(), 4);
        let drill = result.files.iter().find(|f| f.file.id == "d2").unwrap();
        assert_eq!(drill.folder_path.as_deref(), Some("Coaching/Drills"));
        let plan = result.files.iter().find(|f| f.file.id == "plan").unwrap();
        assert_eq!(plan.folder_path, None);

        assert_eq!(result.tree.children.len(), 1);
        assert_eq!(result.tree.children[0].children[0].path, "Coaching/Drills");

        let stored = store.get_folder("drills").await.unwrap().unwrap();
        assert_eq!(stored.depth, 2);
        assert_eq!(stored.parent_id.as_deref(), Some("coaching"));
        assert_eq!(store.list_folders().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_max_depth_stops_descent() {
        let drive = team_drive();
        let store = Arc::new(MemoryStore::new());
        let discovery = DocumentDiscovery::new(drive, store, Some("root".into()), 1);

        let result = discovery.discover().await.unwrap();
        assert_eq!(result.files.len(), 1);
        assert_eq!(result.skipped_folders, 1);
        assert_eq!(result.folders.len(), 2);
    }

    #[tokio::test]
    async fn test_cycle_is_visited_once() {
        let drive = team_drive();
        // shortcut-like loop: Drills also lists Coaching as a child
        drive.add_parent("coaching", "drills");
        let store = Arc::new(MemoryStore::new());
        let discovery = DocumentDiscovery::new(drive, store, Some("root".into()), 10);

        let result = discovery.discover().await.unwrap();
        assert_eq!(result.folders.len(), 3);
        assert_eq!(result.skipped_folders, 1);
        assert_eq!(result.files.len(), 4);
    }

    #[tokio::test]
    async fn test_missing_root_is_an_error() {
        let store = Arc::new(MemoryStore::new());
        let discovery = DocumentDiscovery::new(Arc::new(FakeDrive::new()), store, Some("gone".into()), 10);
        assert!(discovery.discover().await.is_err());
    }
}
