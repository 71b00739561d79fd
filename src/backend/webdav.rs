use std::{collections::BTreeMap, fs::File, io::Write, path::Path};

use log::{debug, error};
use quick_xml::{events::Event, Reader};
use reqwest::{
    blocking::{Client, RequestBuilder, Response},
    Method, StatusCode,
};
use tempfile::{NamedTempFile, TempPath};

use super::{required, Backend, BackendFile, JobStatus, RetrievalOptions, SYNC_INVENTORY_JOB};
use crate::Result;

const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:"><d:prop><d:resourcetype/><d:getcontentlength/></d:prop></d:propfind>"#;

/// Stores archives as files below a WebDAV collection. Retrieval keys are the
/// file names relative to the configured URL.
pub struct WebDavBackend {
    client: Client,
    url: Option<String>,
    username: Option<String>,
    password: Option<String>,
}

impl WebDavBackend {
    pub fn new(url: &str, username: &str, password: &str) -> Self {
        Self {
            client: Client::new(),
            url: Some(url.to_string()),
            username: Some(username.to_string()),
            password: Some(password.to_string()),
        }
    }

    pub fn from_settings(settings: &BTreeMap<String, String>) -> Result<Self> {
        let client = Client::builder().build()?;
        Ok(Self {
            client,
            url: settings.get("url").cloned(),
            username: settings.get("username").cloned(),
            password: settings.get("password").cloned(),
        })
    }

    fn base_url(&self) -> Result<String> {
        Ok(required(&self.url, "url")?.trim_end_matches('/').to_string())
    }

    fn object_url(&self, name: &str) -> Result<String> {
        if name.is_empty() || name.contains('/') {
            return Err(crate::icebox_error!(InvalidParameter {
                description: format!("Invalid retrieval key '{name}'"),
            }));
        }
        Ok(format!("{}/{name}", self.base_url()?))
    }

    fn request(&self, method: Method, url: &str) -> Result<RequestBuilder> {
        let username = required(&self.username, "username")?;
        let password = required(&self.password, "password")?;
        debug!("{method} {url}");
        Ok(self
            .client
            .request(method, url)
            .basic_auth(username, Some(password)))
    }

    fn propfind(&self, depth: &str) -> Result<Response> {
        let method = Method::from_bytes(b"PROPFIND").map_err(|err| {
            crate::icebox_error!(BackendError {
                description: format!("Invalid HTTP method: {err}"),
            })
        })?;
        let url = format!("{}/", self.base_url()?);
        let response = self
            .request(method, &url)?
            .header("Depth", depth)
            .header("Content-Type", "application/xml")
            .body(PROPFIND_BODY)
            .send()?
            .error_for_status()?;
        Ok(response)
    }

    fn upload(&self, path: &Path, name: &str) -> Result<String> {
        let url = self.object_url(name)?;
        let file = File::open(path)?;
        self.request(Method::PUT, &url)?
            .body(file)
            .send()?
            .error_for_status()?;
        Ok(name.to_string())
    }
}

/// One `<response>` element of a multistatus reply.
#[derive(Default)]
struct DavEntry {
    href: String,
    is_collection: bool,
    content_length: u64,
}

/// Extracts the plain files from a `PROPFIND` multistatus document.
fn parse_multistatus(xml: &str) -> Result<Vec<BackendFile>> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut files = Vec::new();
    let mut current: Option<DavEntry> = None;
    let mut element: Vec<u8> = Vec::new();
    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                let local = e.local_name().as_ref().to_vec();
                match local.as_slice() {
                    b"response" => current = Some(DavEntry::default()),
                    b"collection" => {
                        if let Some(entry) = current.as_mut() {
                            entry.is_collection = true;
                        }
                    }
                    _ => {}
                }
                element = local;
            }
            Event::Empty(e) => {
                if e.local_name().as_ref() == b"collection" {
                    if let Some(entry) = current.as_mut() {
                        entry.is_collection = true;
                    }
                }
            }
            Event::Text(t) => {
                if let Some(entry) = current.as_mut() {
                    let text = t.unescape()?;
                    match element.as_slice() {
                        b"href" => entry.href = text.into_owned(),
                        b"getcontentlength" => {
                            entry.content_length = text.trim().parse().unwrap_or_default()
                        }
                        _ => {}
                    }
                }
            }
            Event::End(e) => {
                if e.local_name().as_ref() == b"response" {
                    if let Some(entry) = current.take() {
                        if !entry.is_collection {
                            if let Some(name) = entry.href.rsplit('/').find(|s| !s.is_empty()) {
                                files.push(BackendFile::new(name, name, entry.content_length));
                            }
                        }
                    }
                }
                element.clear();
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(files)
}

impl Backend for WebDavBackend {
    fn box_init(&self) -> Result<()> {
        self.propfind("0")?;
        Ok(())
    }

    fn store_data(&self, path: &Path, name: &str) -> Result<String> {
        self.upload(path, name)
    }

    fn store_meta(&self, path: &Path, name: &str) -> Result<String> {
        self.upload(path, name)
    }

    fn retrieve_init(&self, retrieval_key: &str, _options: &RetrievalOptions) -> Result<String> {
        Ok(retrieval_key.to_string())
    }

    fn retrieve_status(&self, job_key: &str) -> JobStatus {
        let response = self
            .object_url(job_key)
            .and_then(|url| Ok(self.request(Method::HEAD, &url)?.send()?));
        match response {
            Ok(r) if r.status().is_success() => JobStatus::Success,
            Ok(r) => {
                error!("WebDAV object {job_key} is not available: {}", r.status());
                JobStatus::Failure
            }
            Err(e) => {
                error!("Failed to check WebDAV object {job_key}: {e}");
                JobStatus::Failure
            }
        }
    }

    fn retrieve_finish(&self, job_key: &str) -> Result<TempPath> {
        let url = self.object_url(job_key)?;
        let mut response = self
            .request(Method::GET, &url)?
            .send()?
            .error_for_status()?;
        let mut tmp = NamedTempFile::new()?;
        response.copy_to(&mut tmp)?;
        tmp.flush()?;
        Ok(tmp.into_temp_path())
    }

    fn delete(&self, retrieval_key: &str) -> Result<()> {
        let url = self.object_url(retrieval_key)?;
        let response = self.request(Method::DELETE, &url)?.send()?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!("{url} already absent");
            return Ok(());
        }
        response.error_for_status()?;
        Ok(())
    }

    fn inventory_init(&self) -> Result<String> {
        Ok(SYNC_INVENTORY_JOB.to_string())
    }

    fn inventory_status(&self, _job_key: &str) -> JobStatus {
        JobStatus::Success
    }

    fn inventory_finish(&self, _job_key: &str) -> Result<Vec<BackendFile>> {
        let body = self.propfind("1")?.text()?;
        parse_multistatus(&body)
    }
}
