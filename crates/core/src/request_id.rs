//! Scheduler request identifiers.
//!
//! A request id encodes a [`DeploymentID`] as `cluster|repo|dir|flavor`, with
//! `%` and `|` escaped inside each component, so that a gatherer can recover
//! the identity of anything it finds on a cluster.

use thiserror::Error;

use crate::{DeploymentID, SourceLocation};

const SEP: char = '|';

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestIdError {
    #[error("request id {0:?}: expected 4 fields separated by '|'")]
    Shape(String),
    #[error("request id {0:?}: bad escape sequence")]
    Escape(String),
    #[error("request id {0:?}: cluster and repo must not be empty")]
    Empty(String),
}

pub fn request_id(id: &DeploymentID) -> String {
    let parts = [id.cluster.as_str(), id.source.repo.as_str(), id.source.dir.as_str(), id.flavor.as_str()];
    let mut out = String::new();
    for (i, p) in parts.iter().enumerate() {
        if i > 0 { out.push(SEP); }
        escape_into(p, &mut out);
    }
    out
}

pub fn parse_request_id(raw: &str) -> Result<DeploymentID, RequestIdError> {
    let parts: Vec<&str> = raw.split(SEP).collect();
    let [cluster, repo, dir, flavor] = parts.as_slice() else {
        return Err(RequestIdError::Shape(raw.to_string()));
    };
    let field = |s: &str| unescape(s).ok_or_else(|| RequestIdError::Escape(raw.to_string()));
    let id = DeploymentID {
        cluster: field(cluster)?,
        source: SourceLocation { repo: field(repo)?, dir: field(dir)? },
        flavor: field(flavor)?,
    };
    if id.cluster.is_empty() || id.source.repo.is_empty() {
        return Err(RequestIdError::Empty(raw.to_string()));
    }
    Ok(id)
}

fn escape_into(s: &str, out: &mut String) {
    for c in s.chars() {
        match c {
            '%' => out.push_str("%25"),
            SEP => out.push_str("%7C"),
            c => out.push(c),
        }
    }
}

fn unescape(s: &str) -> Option<String> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let code: String = chars.by_ref().take(2).collect();
        match code.as_str() {
            "25" => out.push('%'),
            "7C" | "7c" => out.push(SEP),
            _ => return None,
        }
    }
    Some(out)
}
