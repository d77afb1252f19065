// src/http.rs
//! Protocol vocabulary shared by the parser, resolver and response writer.

/// Request methods the server accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Method {
    #[default]
    Get,
    Post,
}

impl Method {
    /// Case-insensitive match against the supported verbs.
    pub fn from_token(token: &[u8]) -> Option<Self> {
        if token.eq_ignore_ascii_case(b"GET") {
            Some(Method::Get)
        } else if token.eq_ignore_ascii_case(b"POST") {
            Some(Method::Post)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
        }
    }
}

/// Where the request parser currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckState {
    #[default]
    RequestLine,
    Headers,
    Content,
}

/// Outcome of scanning for one CRLF-terminated line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStatus {
    Ok,
    Bad,
    Open,
}

/// Result codes flowing from the parser and resolver to the response writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpCode {
    /// More bytes are needed.
    NoRequest,
    /// A complete request was parsed.
    GetRequest,
    BadRequest,
    NoResource,
    ForbiddenRequest,
    /// The target resolved to a readable regular file.
    FileRequest,
    InternalError,
    ClosedConnection,
}

/// Response status lines and canned bodies.
pub struct Status {
    pub code: u16,
    pub title: &'static str,
    pub body: &'static str,
}

pub const OK_200: Status = Status {
    code: 200,
    title: "OK",
    body: "",
};

pub const ERROR_403: Status = Status {
    code: 403,
    title: "Forbidden",
    body: "You do not have permission to get file from this server.\n",
};

pub const ERROR_404: Status = Status {
    code: 404,
    title: "Not Found",
    body: "The requested file was not found on this server.\n",
};

pub const ERROR_500: Status = Status {
    code: 500,
    title: "Internal Error",
    body: "There was an unusual problem serving the request file.\n",
};

/// Body sent for a successful request whose file is empty.
pub const EMPTY_PAGE: &str = "<html><body></body></html>";
