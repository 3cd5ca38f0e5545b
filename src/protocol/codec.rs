//! Wire request grammar and reply encoding.
//!
//! Requests are single lines of the form `name("arg", "arg")`: the literal
//! name of a server-side operation with double-quoted string arguments.
//! Dispatch is over a closed table: names outside [`Request`] are answered
//! with `Unknown command`, grammar breakage with `Invalid syntax`, and a
//! known name applied to the wrong number of arguments with
//! `Unknown error`. None of these abort the serve loop.
//!
//! Replies are JSON: booleans, strings, or arrays in the
//! `{"__ndarray__": [...], "dtype": ..., "shape": [...]}` envelope.

use serde_json::json;

/// The closed set of wire operations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    ReInitialize,
    SequencerRunning,
    SequencerStopped,
    IsSequencerRunning,
    LearnerRunning,
    LearnerStopped,
    IsLearnerRunning,
    IsHeaderInitialized,
    GetParamHeader,
    GetResultHeader,
    ReceiveParamHeader(String),
    SendParamHeader,
    ReceiveResultHeader(String),
    SendResultHeader,
    IsLastExpUnread,
    GetLastParam,
    GetLastResult,
    ReceiveLastExp(String, String),
    IsNextExpUnread,
    SendNextExp,
}

/// A request the server answers with a plain-text error instead of a value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestError {
    UnknownCommand,
    InvalidSyntax,
    Failed,
}

impl RequestError {
    pub fn reply_text(self) -> &'static str {
        match self {
            RequestError::UnknownCommand => "Unknown command",
            RequestError::InvalidSyntax => "Invalid syntax",
            RequestError::Failed => "Unknown error",
        }
    }
}

/// Values a dispatched operation can reply with.
#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
    Bool(bool),
    Text(String),
    FloatArray(Vec<f64>),
    StrArray(Vec<String>),
}

pub fn parse_request(line: &str) -> Result<Request, RequestError> {
    let line = line.trim();
    let open = line.find('(').ok_or(RequestError::InvalidSyntax)?;
    let name = &line[..open];
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(RequestError::InvalidSyntax);
    }
    if !line.ends_with(')') {
        return Err(RequestError::InvalidSyntax);
    }
    let args = parse_args(&line[open + 1..line.len() - 1])?;
    build(name, args)
}

fn parse_args(text: &str) -> Result<Vec<String>, RequestError> {
    let mut rest = text.trim();
    if rest.is_empty() {
        return Ok(Vec::new());
    }
    let mut args = Vec::new();
    loop {
        rest = rest.trim_start();
        if !rest.starts_with('"') {
            return Err(RequestError::InvalidSyntax);
        }
        let closing = rest[1..].find('"').ok_or(RequestError::InvalidSyntax)? + 1;
        args.push(rest[1..closing].to_string());
        rest = rest[closing + 1..].trim_start();
        if rest.is_empty() {
            return Ok(args);
        }
        let Some(after_comma) = rest.strip_prefix(',') else {
            return Err(RequestError::InvalidSyntax);
        };
        rest = after_comma;
    }
}

fn build(name: &str, args: Vec<String>) -> Result<Request, RequestError> {
    let arity = args.len();
    let mut args = args.into_iter();
    let request = match name {
        "reInitialize" => Request::ReInitialize,
        "sequencerRunning" => Request::SequencerRunning,
        "sequencerStopped" => Request::SequencerStopped,
        "isSequencerRunning" => Request::IsSequencerRunning,
        "learnerRunning" => Request::LearnerRunning,
        "learnerStopped" => Request::LearnerStopped,
        "isLearnerRunning" => Request::IsLearnerRunning,
        "isHeaderInitialized" => Request::IsHeaderInitialized,
        "getParamHeader" => Request::GetParamHeader,
        "getResultHeader" => Request::GetResultHeader,
        "sendParamHeaderAsStr" => Request::SendParamHeader,
        "sendResultHeaderAsStr" => Request::SendResultHeader,
        "isLastExpUnread" => Request::IsLastExpUnread,
        "getLastParam" => Request::GetLastParam,
        "getLastResult" => Request::GetLastResult,
        "isNextExpUnread" => Request::IsNextExpUnread,
        "sendNextExpAsStr" => Request::SendNextExp,
        "receiveParamHeaderAsStr" | "receiveResultHeaderAsStr" | "receiveLastExpAsStr" => {
            let mut take = || args.next().ok_or(RequestError::Failed);
            let request = match name {
                "receiveParamHeaderAsStr" => Request::ReceiveParamHeader(take()?),
                "receiveResultHeaderAsStr" => Request::ReceiveResultHeader(take()?),
                _ => Request::ReceiveLastExp(take()?, take()?),
            };
            return expect_arity(request, arity);
        }
        _ => return Err(RequestError::UnknownCommand),
    };
    // Every remaining operation is nullary.
    if arity != 0 {
        return Err(RequestError::Failed);
    }
    Ok(request)
}

fn expect_arity(request: Request, arity: usize) -> Result<Request, RequestError> {
    let expected = match request {
        Request::ReceiveLastExp(..) => 2,
        _ => 1,
    };
    if arity != expected {
        return Err(RequestError::Failed);
    }
    Ok(request)
}

pub fn encode_reply(reply: &Reply) -> String {
    match reply {
        Reply::Bool(value) => serde_json::Value::Bool(*value).to_string(),
        Reply::Text(text) => serde_json::Value::String(text.clone()).to_string(),
        Reply::FloatArray(values) => json!({
            "__ndarray__": values,
            "dtype": "float64",
            "shape": [values.len()],
        })
        .to_string(),
        Reply::StrArray(names) => json!({
            "__ndarray__": names,
            "dtype": "str",
            "shape": [names.len()],
        })
        .to_string(),
    }
}
