//! Scripted in-memory Drive used by the pipeline tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::drive::{
    ChangeList, ChannelRequest, ChannelResponse, DriveApi, DriveError, DriveFile, DriveResult,
    FileList, FOLDER_MIME,
};

const PAGE: usize = 2;

pub(crate) fn file(id: &str, name: &str, mime: &str, parent: &str, modified: &str) -> DriveFile {
    DriveFile {
        id: id.to_string(),
        name: name.to_string(),
        mime_type: mime.to_string(),
        parents: vec![parent.to_string()],
        modified_time: Some(modified.parse().expect("rfc3339 timestamp")),
        web_view_link: Some(format!("https://docs.google.com/d/{}", id)),
        ..Default::default()
    }
}

pub(crate) fn folder(id: &str, name: &str, parent: Option<&str>) -> DriveFile {
    DriveFile {
        id: id.to_string(),
        name: name.to_string(),
        mime_type: FOLDER_MIME.to_string(),
        parents: parent.map(|p| vec![p.to_string()]).unwrap_or_default(),
        modified_time: Some(Utc::now()),
        ..Default::default()
    }
}

#[derive(Default)]
struct State {
    files: HashMap<String, DriveFile>,
    bodies: HashMap<String, String>,
    failing: HashSet<String>,
    fetches: usize,
    start_token: String,
    changes: HashMap<String, ChangeList>,
    change_calls: usize,
    watches: Vec<ChannelRequest>,
    stopped: Vec<(String, String)>,
    created: usize,
}

pub(crate) struct FakeDrive {
    state: Mutex<State>,
}

impl FakeDrive {
    pub fn new() -> Self {
        let state = State {
            start_token: "1".to_string(),
            ..Default::default()
        };
        Self {
            state: Mutex::new(state),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("fake drive lock")
    }

    pub fn add_folder(&self, folder: DriveFile) {
        self.state().files.insert(folder.id.clone(), folder);
    }

    pub fn add_file(&self, file: DriveFile, body: &str) {
        let mut state = self.state();
        state.bodies.insert(file.id.clone(), body.to_string());
        state.files.insert(file.id.clone(), file);
    }

    pub fn remove_file(&self, id: &str) {
        self.state().files.remove(id);
    }

    pub fn add_parent(&self, id: &str, parent: &str) {
        if let Some(f) = self.state().files.get_mut(id) {
            f.parents.push(parent.to_string());
        }
    }

    pub fn fail_fetch(&self, id: &str) {
        self.state().failing.insert(id.to_string());
    }

    pub fn fetch_count(&self) -> usize {
        self.state().fetches
    }

    pub fn set_start_token(&self, token: &str) {
        self.state().start_token = token.to_string();
    }

    /// Page returned by `list_changes(token)`.
    pub fn set_changes(&self, token: &str, page: ChangeList) {
        self.state().changes.insert(token.to_string(), page);
    }

    pub fn change_calls(&self) -> usize {
        self.state().change_calls
    }

    pub fn watches(&self) -> Vec<ChannelRequest> {
        self.state().watches.clone()
    }

    pub fn stopped(&self) -> Vec<(String, String)> {
        self.state().stopped.clone()
    }

    fn fetch(&self, file_id: &str) -> DriveResult<String> {
        let mut state = self.state();
        if state.failing.contains(file_id) {
            return Err(DriveError::Status {
                label: "fake.fetch".into(),
                status: 500,
                body: "backend error".into(),
            });
        }
        state.fetches += 1;
        state
            .bodies
            .get(file_id)
            .cloned()
            .ok_or_else(|| DriveError::NotFound(file_id.to_string()))
    }
}

fn parent_in_query(query: &str) -> Option<&str> {
    let rest = query.strip_prefix('\'')?;
    rest.split('\'').next()
}

fn channel_response(channel: &ChannelRequest) -> ChannelResponse {
    ChannelResponse {
        id: channel.id.clone(),
        resource_id: format!("res-{}", channel.id),
        resource_uri: None,
        expiration: channel.expiration.clone(),
    }
}

#[async_trait]
impl DriveApi for FakeDrive {
    async fn list_page(&self, query: &str, page_token: Option<&str>) -> DriveResult<FileList> {
        let parent = parent_in_query(query).unwrap_or_default().to_string();
        let state = self.state();
        let mut matching: Vec<DriveFile> = state
            .files
            .values()
            .filter(|f| !f.trashed && f.parents.contains(&parent))
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.id.cmp(&b.id));

        let start: usize = page_token.and_then(|t| t.parse().ok()).unwrap_or(0);
        let end = (start + PAGE).min(matching.len());
        let files = matching.get(start..end).map(|s| s.to_vec()).unwrap_or_default();
        let next_page_token = (end < matching.len()).then(|| end.to_string());
        Ok(FileList {
            files,
            next_page_token,
        })
    }

    async fn get_file(&self, file_id: &str) -> DriveResult<Option<DriveFile>> {
        Ok(self.state().files.get(file_id).cloned())
    }

    async fn export(&self, file_id: &str, _mime: &str) -> DriveResult<String> {
        self.fetch(file_id)
    }

    async fn download(&self, file_id: &str) -> DriveResult<String> {
        self.fetch(file_id)
    }

    async fn create_file(
        &self,
        name: &str,
        mime: &str,
        parents: &[String],
        body: &str,
    ) -> DriveResult<DriveFile> {
        let mut state = self.state();
        state.created += 1;
        let created = DriveFile {
            id: format!("new-{}", state.created),
            name: name.to_string(),
            mime_type: mime.to_string(),
            parents: parents.to_vec(),
            modified_time: Some(Utc::now()),
            ..Default::default()
        };
        state.bodies.insert(created.id.clone(), body.to_string());
        state.files.insert(created.id.clone(), created.clone());
        Ok(created)
    }

    async fn update_file(&self, file_id: &str, body: &str) -> DriveResult<DriveFile> {
        let mut state = self.state();
        let mut updated = state
            .files
            .get(file_id)
            .cloned()
            .ok_or_else(|| DriveError::NotFound(file_id.to_string()))?;
        updated.modified_time = Some(Utc::now());
        state.bodies.insert(file_id.to_string(), body.to_string());
        state.files.insert(file_id.to_string(), updated.clone());
        Ok(updated)
    }

    async fn get_start_page_token(&self) -> DriveResult<String> {
        Ok(self.state().start_token.clone())
    }

    async fn list_changes(&self, page_token: &str) -> DriveResult<ChangeList> {
        let mut state = self.state();
        state.change_calls += 1;
        Ok(state.changes.get(page_token).cloned().unwrap_or_else(|| ChangeList {
            changes: Vec::new(),
            next_page_token: None,
            new_start_page_token: Some(page_token.to_string()),
        }))
    }

    async fn watch_changes(
        &self,
        _page_token: &str,
        channel: &ChannelRequest,
    ) -> DriveResult<ChannelResponse> {
        self.state().watches.push(channel.clone());
        Ok(channel_response(channel))
    }

    async fn watch_file(&self, _file_id: &str, channel: &ChannelRequest) -> DriveResult<ChannelResponse> {
        self.state().watches.push(channel.clone());
        Ok(channel_response(channel))
    }

    async fn stop_channel(&self, channel_id: &str, resource_id: &str) -> DriveResult<()> {
        self.state()
            .stopped
            .push((channel_id.to_string(), resource_id.to_string()));
        Ok(())
    }
}
