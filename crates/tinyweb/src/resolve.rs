// src/resolve.rs
//! Maps a parsed request onto a file under the document root.
//!
//! A handful of single-character URL prefixes select fixed pages, and POST
//! requests to `/2…` and `/3…` run the login and registration forms before
//! picking the page to show.

use crate::credentials::{CredentialTable, Registration, StorePool};
use crate::http::{HttpCode, Method};
use crate::parser::Request;
use crate::syscalls::FileMapping;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tracing::{debug, error, info};

/// Longest resolved path, terminator included.
pub const FILENAME_LEN: usize = 200;

/// Outcome of resolving one request.
pub struct Resolution {
    pub code: HttpCode,
    pub path: String,
    pub file_len: usize,
    /// Present only for a non-empty `FileRequest`.
    pub mapping: Option<FileMapping>,
}

impl Resolution {
    fn code(code: HttpCode, path: String) -> Self {
        Self {
            code,
            path,
            file_len: 0,
            mapping: None,
        }
    }
}

pub struct Resolver {
    doc_root: String,
    default_page: String,
    credentials: CredentialTable,
    store: StorePool,
}

impl Resolver {
    pub fn new(
        doc_root: impl AsRef<Path>,
        default_page: impl Into<String>,
        credentials: CredentialTable,
        store: StorePool,
    ) -> Self {
        Self {
            doc_root: doc_root.as_ref().to_string_lossy().into_owned(),
            default_page: default_page.into(),
            credentials,
            store,
        }
    }

    pub fn doc_root(&self) -> &str {
        &self.doc_root
    }

    pub fn default_page(&self) -> &str {
        &self.default_page
    }

    pub fn credentials(&self) -> &CredentialTable {
        &self.credentials
    }

    pub fn resolve(&self, req: &Request, body: Option<&[u8]>) -> Resolution {
        let page = match self.select_page(req, body) {
            Ok(page) => page,
            Err(code) => return Resolution::code(code, String::new()),
        };
        if page.split('/').any(|segment| segment == "..") {
            debug!(url = %req.url, "refusing path with parent segments");
            return Resolution::code(HttpCode::ForbiddenRequest, String::new());
        }

        let path = bounded_join(&self.doc_root, page);
        let meta = match fs::metadata(&path) {
            Ok(meta) => meta,
            Err(_) => return Resolution::code(HttpCode::NoResource, path),
        };
        if meta.permissions().mode() & 0o004 == 0 {
            return Resolution::code(HttpCode::ForbiddenRequest, path);
        }
        if meta.is_dir() {
            return Resolution::code(HttpCode::BadRequest, path);
        }

        let file_len = meta.len() as usize;
        if file_len == 0 {
            return Resolution::code(HttpCode::FileRequest, path);
        }
        match FileMapping::open(Path::new(&path), file_len) {
            Ok(mapping) => Resolution {
                code: HttpCode::FileRequest,
                path,
                file_len,
                mapping: Some(mapping),
            },
            Err(e) => {
                error!(path = %path, error = %e, "failed to map file");
                Resolution::code(HttpCode::InternalError, path)
            }
        }
    }

    /// The URL path to serve, after prefix routing and form handling.
    fn select_page<'a>(&self, req: &'a Request, body: Option<&[u8]>) -> Result<&'a str, HttpCode> {
        let selector = req.url.as_bytes().get(1).copied();
        if req.method == Method::Post && req.cgi {
            match selector {
                Some(b'2') => {
                    let (user, password) = parse_form(body).ok_or(HttpCode::BadRequest)?;
                    return Ok(if self.credentials.verify(&user, &password) {
                        info!(user = %user, "login accepted");
                        "/welcome.html"
                    } else {
                        "/logError.html"
                    });
                }
                Some(b'3') => {
                    let (user, password) = parse_form(body).ok_or(HttpCode::BadRequest)?;
                    return Ok(match self.credentials.register(&self.store, &user, &password) {
                        Registration::Created => "/log.html",
                        Registration::NameTaken | Registration::StoreFailed => "/registerError.html",
                    });
                }
                _ => {}
            }
        }
        Ok(match selector {
            Some(b'0') => "/register.html",
            Some(b'1') => "/log.html",
            Some(b'5') => "/picture.html",
            Some(b'6') => "/video.html",
            Some(b'7') => "/fans.html",
            _ => req.url.as_str(),
        })
    }
}

/// Split a `user=<name>&passwd=<pass>` form body.
pub fn parse_form(body: Option<&[u8]>) -> Option<(String, String)> {
    let body = std::str::from_utf8(body?).ok()?;
    let rest = body.strip_prefix("user=")?;
    let (user, password) = rest.split_once("&passwd=")?;
    if user.is_empty() {
        return None;
    }
    Some((user.to_string(), password.to_string()))
}

/// `root` followed by `url`, cut to fit [`FILENAME_LEN`].
fn bounded_join(root: &str, url: &str) -> String {
    let mut path = String::with_capacity(FILENAME_LEN);
    for part in [root, url] {
        for ch in part.chars() {
            if path.len() + ch.len_utf8() > FILENAME_LEN - 1 {
                return path;
            }
            path.push(ch);
        }
    }
    path
}
