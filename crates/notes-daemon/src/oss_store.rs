//! Object store over the Aliyun OSS REST API.
//!
//! Requests are signed with the V1 scheme:
//! `Authorization: OSS {AccessKeyId}:{base64(hmac-sha1(secret, StringToSign))}`
//! where StringToSign is
//! `VERB \n Content-MD5 \n Content-Type \n Date \n CanonicalizedOSSHeaders CanonicalizedResource`.

use anyhow::Context;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use notes_sync::StorageConfig;
use notes_sync::store::{ObjectMeta, ObjectStore, Result, StoreError, validate_key};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, DATE};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use sha1::Sha1;
use std::time::Duration;
use tracing::debug;

type HmacSha1 = Hmac<Sha1>;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const LIST_PAGE_SIZE: &str = "1000";

pub struct OssStore {
    client: reqwest::Client,
    config: StorageConfig,
    /// `{bucket}.{endpoint}`
    host: String,
}

impl OssStore {
    pub fn new(config: StorageConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        let host = format!("{}.{}", config.bucket, config.endpoint_host());
        Ok(Self {
            client,
            config,
            host,
        })
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    fn object_url(&self, key: &str) -> String {
        format!("https://{}/{}", self.host, encode_key(key))
    }

    /// Build a signed request. `resource` is the canonicalized resource.
    fn request(
        &self,
        method: Method,
        url: &str,
        content_type: &str,
        resource: &str,
    ) -> Result<RequestBuilder> {
        let date = http_date(Utc::now());
        let to_sign = string_to_sign(method.as_str(), "", content_type, &date, &[], resource);
        let signature = sign(&self.config.access_key_secret, &to_sign)?;

        let mut builder = self
            .client
            .request(method, url)
            .header(DATE, date)
            .header(
                AUTHORIZATION,
                format!("OSS {}:{}", self.config.access_key_id, signature),
            );
        if !content_type.is_empty() {
            builder = builder.header(CONTENT_TYPE, content_type);
        }
        Ok(builder)
    }

    fn object_request(&self, method: Method, key: &str, content_type: &str) -> Result<RequestBuilder> {
        validate_key(key)?;
        let resource = format!("/{}/{}", self.config.bucket, key);
        self.request(method, &self.object_url(key), content_type, &resource)
    }
}

#[async_trait]
impl ObjectStore for OssStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let response = self
            .object_request(Method::GET, key, "")?
            .send()
            .await
            .map_err(transport_error)?;
        let response = check(key, response).await?;
        let bytes = response.bytes().await.map_err(transport_error)?;
        debug!("GET {} ({} bytes)", key, bytes.len());
        Ok(bytes.to_vec())
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let response = self
            .object_request(Method::PUT, key, content_type_for(key))?
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(transport_error)?;
        check(key, response).await?;
        debug!("PUT {} ({} bytes)", key, bytes.len());
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let url = format!("https://{}/", self.host);
        let resource = format!("/{}/", self.config.bucket);
        let mut objects = Vec::new();
        let mut marker = String::new();

        loop {
            let response = self
                .request(Method::GET, &url, "", &resource)?
                .query(&[
                    ("prefix", prefix),
                    ("marker", marker.as_str()),
                    ("max-keys", LIST_PAGE_SIZE),
                ])
                .send()
                .await
                .map_err(transport_error)?;
            let body = check(&self.config.bucket, response)
                .await?
                .text()
                .await
                .map_err(transport_error)?;

            let page = parse_listing(&body)?;
            objects.extend(page.objects);
            match page.next_marker {
                Some(next) if page.truncated => marker = next,
                _ => break,
            }
        }

        debug!("LIST {} ({} objects)", prefix, objects.len());
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        // OSS answers 204 for missing keys; HEAD first to report NotFound
        let response = self
            .object_request(Method::HEAD, key, "")?
            .send()
            .await
            .map_err(transport_error)?;
        check(key, response).await?;

        let response = self
            .object_request(Method::DELETE, key, "")?
            .send()
            .await
            .map_err(transport_error)?;
        check(key, response).await?;
        debug!("DELETE {}", key);
        Ok(())
    }
}

/// RFC 1123 date as required by the `Date` header.
pub fn http_date(now: DateTime<Utc>) -> String {
    now.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

pub fn string_to_sign(
    verb: &str,
    content_md5: &str,
    content_type: &str,
    date: &str,
    oss_headers: &[(&str, &str)],
    resource: &str,
) -> String {
    let mut headers: Vec<(String, &str)> = oss_headers
        .iter()
        .map(|(name, value)| (name.to_ascii_lowercase(), value.trim()))
        .collect();
    headers.sort();

    let mut out = format!("{}\n{}\n{}\n{}\n", verb, content_md5, content_type, date);
    for (name, value) in headers {
        out.push_str(&name);
        out.push(':');
        out.push_str(value);
        out.push('\n');
    }
    out.push_str(resource);
    out
}

pub fn sign(secret: &str, string_to_sign: &str) -> Result<String> {
    let mut mac = HmacSha1::new_from_slice(secret.as_bytes())
        .map_err(|e| StoreError::Io(format!("signing key rejected: {}", e)))?;
    mac.update(string_to_sign.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

/// Percent-encode each path segment of `key`.
fn encode_key(key: &str) -> String {
    key.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn content_type_for(key: &str) -> &'static str {
    let ext = key
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "json" => "application/json",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "bmp" => "image/bmp",
        _ => "application/octet-stream",
    }
}

fn transport_error(e: reqwest::Error) -> StoreError {
    StoreError::Io(e.to_string())
}

async fn check(key: &str, response: Response) -> Result<Response> {
    let status = response.status();
    if status == StatusCode::NOT_FOUND {
        return Err(StoreError::NotFound(key.to_string()));
    }
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = match (element(&body, "Code"), element(&body, "Message")) {
        (Some(code), Some(message)) => format!("{}: {}", unescape(code), unescape(message)),
        _ => status.canonical_reason().unwrap_or("request failed").to_string(),
    };
    Err(StoreError::Http {
        status: status.as_u16(),
        message,
    })
}

#[derive(Debug, Default, PartialEq)]
struct ListPage {
    objects: Vec<ObjectMeta>,
    truncated: bool,
    next_marker: Option<String>,
}

/// Parse a `ListBucketResult` document.
fn parse_listing(xml: &str) -> Result<ListPage> {
    let mut page = ListPage::default();

    for contents in elements(xml, "Contents") {
        let key = element(contents, "Key")
            .map(unescape)
            .ok_or_else(|| StoreError::Io("listing entry without Key".into()))?;
        let size = element(contents, "Size")
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0);
        let last_modified = element(contents, "LastModified")
            .and_then(|s| s.trim().parse::<DateTime<Utc>>().ok())
            .unwrap_or_else(Utc::now);
        page.objects.push(ObjectMeta {
            key,
            size,
            last_modified,
        });
    }

    page.truncated = element(xml, "IsTruncated").map(str::trim) == Some("true");
    page.next_marker = element(xml, "NextMarker")
        .map(unescape)
        .filter(|m| !m.is_empty())
        .or_else(|| page.objects.last().map(|o| o.key.clone()));
    Ok(page)
}

/// Bodies of every `<name>...</name>` element, in document order.
fn elements<'a>(xml: &'a str, name: &str) -> Vec<&'a str> {
    let open = format!("<{}>", name);
    let close = format!("</{}>", name);
    let mut found = Vec::new();
    let mut rest = xml;

    while let Some(start) = rest.find(&open) {
        let after = &rest[start + open.len()..];
        let Some(end) = after.find(&close) else {
            break;
        };
        found.push(&after[..end]);
        rest = &after[end + close.len()..];
    }
    found
}

fn element<'a>(xml: &'a str, name: &str) -> Option<&'a str> {
    elements(xml, name).into_iter().next()
}

fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> StorageConfig {
        StorageConfig {
            region: "oss-cn-hangzhou".into(),
            access_key_id: "id".into(),
            access_key_secret: "secret".into(),
            bucket: "notes".into(),
            endpoint: None,
            public_base_url: None,
        }
    }

    #[test]
    fn test_sign_object_read() {
        let to_sign = string_to_sign(
            "GET",
            "",
            "",
            "Wed, 01 May 2024 10:00:00 GMT",
            &[],
            "/notes/freeeditor/sync/index.json",
        );
        assert_eq!(
            to_sign,
            "GET\n\n\nWed, 01 May 2024 10:00:00 GMT\n/notes/freeeditor/sync/index.json"
        );
        assert_eq!(
            sign("secret", &to_sign).unwrap(),
            "FQdSVdSmaPbWR3kuEq3VSMaPZ/Q="
        );
    }

    #[test]
    fn test_sign_with_oss_headers() {
        let to_sign = string_to_sign(
            "PUT",
            "ODBGOERFMDMzQTczRUY3NUE3NzA5QzdFNUYzMDQxNEM=",
            "text/html",
            "Thu, 17 Nov 2005 18:49:58 GMT",
            &[
                ("X-OSS-Meta-Author", "foo@example.com"),
                ("X-OSS-Magic", " abracadabra"),
            ],
            "/oss-example/nelson",
        );
        assert!(to_sign.contains("x-oss-magic:abracadabra\nx-oss-meta-author:foo@example.com\n"));
        assert_eq!(
            sign("OtxrzxIsfpFjA7SwPzILwy8Bw21TLhquhboDYROV", &to_sign).unwrap(),
            "fV5fq7DPwNbrrig7nvUSZIVyruI="
        );
    }

    #[test]
    fn test_http_date() {
        let at: DateTime<Utc> = "2024-05-01T10:00:00Z".parse().unwrap();
        assert_eq!(http_date(at), "Wed, 01 May 2024 10:00:00 GMT");
    }

    #[test]
    fn test_urls() {
        let store = OssStore::new(config()).unwrap();
        assert_eq!(
            store.object_url("freeeditor/sync/articles/a b.json"),
            "https://notes.oss-cn-hangzhou.aliyuncs.com/freeeditor/sync/articles/a%20b.json"
        );

        let mut custom = config();
        custom.endpoint = Some("https://oss-accelerate.aliyuncs.com/".into());
        let store = OssStore::new(custom).unwrap();
        assert_eq!(store.object_url("k"), "https://notes.oss-accelerate.aliyuncs.com/k");
    }

    #[test]
    fn test_rejects_incomplete_config() {
        let mut incomplete = config();
        incomplete.access_key_secret.clear();
        assert!(OssStore::new(incomplete).is_err());
    }

    #[test]
    fn test_content_types() {
        assert_eq!(content_type_for("a/index.json"), "application/json");
        assert_eq!(content_type_for("a/1-x.JPG"), "image/jpeg");
        assert_eq!(content_type_for("a/blob"), "application/octet-stream");
    }

    #[test]
    fn test_parse_listing() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult>
  <Name>notes</Name>
  <Prefix>freeeditor/sync/articles/</Prefix>
  <Marker></Marker>
  <MaxKeys>1000</MaxKeys>
  <IsTruncated>true</IsTruncated>
  <NextMarker>freeeditor/sync/articles/b.json</NextMarker>
  <Contents>
    <Key>freeeditor/sync/articles/a&amp;1.json</Key>
    <LastModified>2024-02-24T08:42:32.000Z</LastModified>
    <ETag>"5B3C1A2E053D763E1B002CC607C5A0FE"</ETag>
    <Size>344</Size>
  </Contents>
  <Contents>
    <Key>freeeditor/sync/articles/b.json</Key>
    <LastModified>2024-02-25T00:00:00.000Z</LastModified>
    <Size>12</Size>
  </Contents>
</ListBucketResult>"#;

        let page = parse_listing(xml).unwrap();
        assert!(page.truncated);
        assert_eq!(page.next_marker.as_deref(), Some("freeeditor/sync/articles/b.json"));
        assert_eq!(page.objects.len(), 2);
        assert_eq!(page.objects[0].key, "freeeditor/sync/articles/a&1.json");
        assert_eq!(page.objects[0].size, 344);
        assert_eq!(
            page.objects[0].last_modified,
            "2024-02-24T08:42:32Z".parse::<DateTime<Utc>>().unwrap()
        );
    }

    #[test]
    fn test_parse_empty_listing() {
        let xml = "<ListBucketResult><IsTruncated>false</IsTruncated></ListBucketResult>";
        assert_eq!(parse_listing(xml).unwrap(), ListPage::default());
    }
}
