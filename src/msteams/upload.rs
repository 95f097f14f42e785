use std::collections::{HashMap, VecDeque};
use std::ops::Range;
use std::path::Path;

use reqwest::header::CONTENT_RANGE;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use super::{GraphClient, RemoteContainer, RemoteError, UploadedFile};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadSession {
    upload_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionStatus {
    #[serde(default)]
    next_expected_ranges: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveItem {
    id: String,
    name: String,
    #[serde(default)]
    web_url: Option<String>,
    #[serde(default)]
    e_tag: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FilesFolder {
    id: String,
    parent_reference: ParentReference,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ParentReference {
    drive_id: String,
}

enum RangeOutcome {
    Accepted,
    Complete(DriveItem),
}

impl GraphClient {
    /// Create session, PUT byte ranges, finish on the range that returns the
    /// drive item. A failed range is retried on its own; when the session
    /// can report `nextExpectedRanges` only those bytes are sent again.
    pub(super) async fn upload_chunked(
        &self,
        container: &RemoteContainer,
        file_name: &str,
        content_type: &str,
        data: &[u8],
    ) -> Result<UploadedFile, RemoteError> {
        if data.is_empty() {
            return Err(RemoteError::BadRequest(format!(
                "refusing to upload empty file name={}",
                file_name
            )));
        }

        let session_url = self.upload_session_url(container, file_name).await?;
        let session: UploadSession = self
            .post_json(
                &session_url,
                &json!({ "item": { "@microsoft.graph.conflictBehavior": "rename" } }),
            )
            .await?;

        let item = self.upload_ranges(&session.upload_url, data).await?;
        let content_url = item.web_url.clone().unwrap_or_default();
        debug!(
            "remote file uploaded name={} size={} item_id={}",
            item.name,
            data.len(),
            item.id
        );
        Ok(UploadedFile {
            id: item
                .e_tag
                .as_deref()
                .and_then(attachment_id_from_etag)
                .unwrap_or_else(|| item.id.clone()),
            content_url: normalize_content_url(&content_url, &item.name),
            name: item.name,
            content_type: content_type.to_string(),
        })
    }

    async fn upload_session_url(
        &self,
        container: &RemoteContainer,
        file_name: &str,
    ) -> Result<String, RemoteError> {
        let name = encode_path_segment(file_name);
        match container {
            RemoteContainer::Channel { .. } => {
                let folder: FilesFolder = self
                    .get_json(&self.url(&format!("{}/filesFolder", container.path())))
                    .await?;
                Ok(self.url(&format!(
                    "/drives/{}/items/{}:/{}:/createUploadSession",
                    folder.parent_reference.drive_id, folder.id, name
                )))
            }
            RemoteContainer::Chat { .. } => Ok(self.url(&format!(
                "/me/drive/root:/Microsoft%20Teams%20Chat%20Files/{}:/createUploadSession",
                name
            ))),
        }
    }

    async fn upload_ranges(&self, upload_url: &str, data: &[u8]) -> Result<DriveItem, RemoteError> {
        let total = data.len();
        let mut pending: VecDeque<Range<usize>> =
            plan_ranges(0..total, self.upload_chunk_size).into();
        let mut failures: HashMap<usize, u32> = HashMap::new();

        while let Some(range) = pending.pop_front() {
            match self.put_range(upload_url, data, &range).await {
                Ok(RangeOutcome::Complete(item)) => return Ok(item),
                Ok(RangeOutcome::Accepted) => {}
                Err(err) if err.is_transient() => {
                    let attempts = failures.entry(range.start).or_insert(0);
                    *attempts += 1;
                    if *attempts > self.max_upload_range_retries {
                        return Err(err);
                    }
                    warn!(
                        "upload range failed, retrying range={}-{} attempt={} error={}",
                        range.start, range.end, attempts, err
                    );
                    match self.upload_status(upload_url).await {
                        Ok(expected) if !expected.is_empty() => {
                            pending = expected
                                .into_iter()
                                .map(|range| range.start..range.end.min(total))
                                .flat_map(|range| plan_ranges(range, self.upload_chunk_size))
                                .collect();
                        }
                        _ => pending.push_front(range),
                    }
                }
                Err(err) => return Err(err),
            }
        }

        Err(RemoteError::Other(
            "upload session finished without a drive item".to_string(),
        ))
    }

    async fn put_range(
        &self,
        upload_url: &str,
        data: &[u8],
        range: &Range<usize>,
    ) -> Result<RangeOutcome, RemoteError> {
        // Upload URLs are pre-authenticated; a bearer token is rejected.
        let response = self
            .http
            .put(upload_url)
            .header(CONTENT_RANGE, content_range(range, data.len()))
            .body(data[range.clone()].to_vec())
            .send()
            .await
            .map_err(RemoteError::from_transport)?;

        let status = response.status();
        match status.as_u16() {
            202 => Ok(RangeOutcome::Accepted),
            200 | 201 => {
                let item = response.json().await.map_err(RemoteError::from_transport)?;
                Ok(RangeOutcome::Complete(item))
            }
            _ => {
                let headers = response.headers().clone();
                let body = response.text().await.unwrap_or_default();
                Err(RemoteError::from_status(status, &headers, &body))
            }
        }
    }

    async fn upload_status(&self, upload_url: &str) -> Result<Vec<Range<usize>>, RemoteError> {
        let response = self
            .http
            .get(upload_url)
            .send()
            .await
            .map_err(RemoteError::from_transport)?;
        if !response.status().is_success() {
            return Ok(Vec::new());
        }
        let status: SessionStatus = response.json().await.map_err(RemoteError::from_transport)?;
        Ok(status
            .next_expected_ranges
            .iter()
            .filter_map(|range| parse_expected_range(range))
            .collect())
    }
}

/// Splits `span` into consecutive ranges of at most `chunk` bytes.
pub(crate) fn plan_ranges(span: Range<usize>, chunk: usize) -> Vec<Range<usize>> {
    let chunk = chunk.max(1);
    let mut ranges = Vec::new();
    let mut start = span.start;
    while start < span.end {
        let end = (start + chunk).min(span.end);
        ranges.push(start..end);
        start = end;
    }
    ranges
}

/// Parses one `nextExpectedRanges` entry, `"start-end"` (inclusive) or
/// `"start-"`, into a half-open range. Open ranges end at `usize::MAX` and
/// are clamped by the caller.
fn parse_expected_range(raw: &str) -> Option<Range<usize>> {
    let (start, end) = raw.split_once('-')?;
    let start = start.trim().parse::<usize>().ok()?;
    let end = match end.trim() {
        "" => usize::MAX,
        end => end.parse::<usize>().ok()?.checked_add(1)?,
    };
    (start < end).then_some(start..end)
}

fn content_range(range: &Range<usize>, total: usize) -> String {
    format!("bytes {}-{}/{}", range.start, range.end - 1, total)
}

/// Graph eTags look like `"{GUID},3"`; the GUID is the attachment id the
/// chat message must reference.
pub(crate) fn attachment_id_from_etag(etag: &str) -> Option<String> {
    let start = etag.find('{')? + 1;
    let end = start + etag[start..].find('}')?;
    let id = &etag[start..end];
    (!id.is_empty()).then(|| id.to_string())
}

/// Graph rejects references whose content URL does not end with the file
/// extension; SharePoint puts it in the `file` query parameter, so that
/// parameter is moved to the end.
pub(crate) fn normalize_content_url(content_url: &str, file_name: &str) -> String {
    let Some(extension) = Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{}", ext))
    else {
        return content_url.to_string();
    };
    if content_url.ends_with(&extension) {
        return content_url.to_string();
    }
    let Ok(mut url) = url::Url::parse(content_url) else {
        return content_url.to_string();
    };

    let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
    let Some(file) = pairs
        .iter()
        .find(|(key, _)| key == "file")
        .map(|(_, value)| value.clone())
    else {
        return content_url.to_string();
    };

    {
        let mut query = url.query_pairs_mut();
        query.clear();
        for (key, value) in pairs.iter().filter(|(key, _)| key != "file") {
            query.append_pair(key, value);
        }
        query.append_pair("file", &file);
    }
    url.to_string()
}

fn encode_path_segment(segment: &str) -> String {
    let mut encoded = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(byte as char)
            }
            _ => encoded.push_str(&format!("%{:02X}", byte)),
        }
    }
    encoded
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;

    use super::*;
    use crate::msteams::RemoteApi;
    use crate::msteams::tests::{client, mock_token};

    const CHUNK: usize = 327_680;

    #[test]
    fn ranges_cover_payload_in_order() {
        let ranges = plan_ranges(0..700_000, CHUNK);
        assert_eq!(ranges, vec![0..327_680, 327_680..655_360, 655_360..700_000]);
        assert_eq!(content_range(&ranges[2], 700_000), "bytes 655360-699999/700000");
    }

    #[test]
    fn expected_ranges_parse() {
        assert_eq!(parse_expected_range("26-49"), Some(26..50));
        assert_eq!(parse_expected_range("100-"), Some(100..usize::MAX));
        assert_eq!(parse_expected_range("x-1"), None);
    }

    #[test]
    fn etag_guid_becomes_attachment_id() {
        assert_eq!(
            attachment_id_from_etag("\"{153617DA-9E70-4FCA-9DB1-3EF2A2B0A1BE},1\"").as_deref(),
            Some("153617DA-9E70-4FCA-9DB1-3EF2A2B0A1BE")
        );
        assert_eq!(attachment_id_from_etag("\"abc\""), None);
    }

    #[test]
    fn file_parameter_moves_to_end() {
        let url = "https://contoso.sharepoint.com/_layouts/Doc.aspx?sourcedoc=x&file=report.docx&action=edit";
        let normalized = normalize_content_url(url, "report.docx");
        assert!(normalized.ends_with("file=report.docx"));
        assert!(normalized.contains("action=edit"));
        assert_eq!(
            normalize_content_url("https://x/files/a.png", "a.png"),
            "https://x/files/a.png"
        );
    }

    #[test]
    fn names_are_path_encoded() {
        assert_eq!(encode_path_segment("my file#1.txt"), "my%20file%231.txt");
    }

    fn mock_session(server: &MockServer) {
        server.mock(|when, then| {
            when.method(GET).path("/v1.0/teams/T/channels/C/filesFolder");
            then.status(200).json_body(serde_json::json!({
                "id": "FOLDER",
                "parentReference": { "driveId": "DRIVE" }
            }));
        });
        let upload_url = server.url("/upload/session-1");
        server.mock(move |when, then| {
            when.method(POST)
                .path("/v1.0/drives/DRIVE/items/FOLDER:/report-v2.bin:/createUploadSession");
            then.status(200).json_body(serde_json::json!({
                "uploadUrl": upload_url,
                "nextExpectedRanges": ["0-"]
            }));
        });
    }

    #[tokio::test]
    async fn uploads_in_ranges_and_returns_reference() {
        let server = MockServer::start();
        mock_token(&server);
        mock_session(&server);
        let first = server.mock(|when, then| {
            when.method(PUT)
                .path("/upload/session-1")
                .header("content-range", "bytes 0-327679/400000");
            then.status(202)
                .json_body(serde_json::json!({ "nextExpectedRanges": ["327680-399999"] }));
        });
        let last = server.mock(|when, then| {
            when.method(PUT)
                .path("/upload/session-1")
                .header("content-range", "bytes 327680-399999/400000");
            then.status(201).json_body(serde_json::json!({
                "id": "ITEM",
                "name": "report-v2.bin",
                "webUrl": "https://contoso.sharepoint.com/sites/T/report-v2.bin",
                "eTag": "\"{AAAA-BBBB},1\""
            }));
        });

        let uploaded = client(&server)
            .upload_file(
                &RemoteContainer::channel("T", "C"),
                "report-v2.bin",
                "application/octet-stream",
                vec![7u8; 400_000],
            )
            .await
            .unwrap();

        first.assert_calls(1);
        last.assert_calls(1);
        assert_eq!(uploaded.id, "AAAA-BBBB");
        assert_eq!(uploaded.name, "report-v2.bin");
    }

    #[tokio::test]
    async fn only_failed_range_is_retried() {
        let server = MockServer::start();
        mock_token(&server);
        mock_session(&server);
        let first = server.mock(|when, then| {
            when.method(PUT)
                .path("/upload/session-1")
                .header("content-range", "bytes 0-327679/400000");
            then.status(202);
        });
        let failing = server.mock(|when, then| {
            when.method(PUT)
                .path("/upload/session-1")
                .header("content-range", "bytes 327680-399999/400000");
            then.status(500);
        });
        let status = server.mock(|when, then| {
            when.method(GET).path("/upload/session-1");
            then.status(200)
                .json_body(serde_json::json!({ "nextExpectedRanges": ["327680-"] }));
        });

        let err = client(&server)
            .upload_file(
                &RemoteContainer::channel("T", "C"),
                "report-v2.bin",
                "application/octet-stream",
                vec![1u8; 400_000],
            )
            .await
            .unwrap_err();

        assert!(matches!(err, RemoteError::TransportTransient(_)));
        first.assert_calls(1);
        failing.assert_calls(4);
        status.assert_calls(3);
    }

    #[tokio::test]
    async fn empty_files_are_rejected() {
        let server = MockServer::start();
        let err = client(&server)
            .upload_file(&RemoteContainer::chat("X"), "empty.txt", "text/plain", Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::BadRequest(_)));
    }
}
