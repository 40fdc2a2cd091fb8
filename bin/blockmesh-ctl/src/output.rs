//! Printing responses and mapping them to process exit codes

use blockmesh_block::BlockError;
use blockmesh_block::backend::EXIT_DEFAULT_ERROR;
use serde::Serialize;
use serde_json::json;
use std::fmt::Display;
use std::process::ExitCode;

/// A rendered command result
#[derive(Debug)]
pub struct Report {
    text: String,
    json: serde_json::Value,
    code: i32,
    /// No response was produced
    error: bool,
}

impl Report {
    /// Result of a finished operation; `ok` is false for a FAIL verdict
    pub fn new<T: Serialize + Display>(value: &T, ok: bool) -> Self {
        let json = serde_json::to_value(value)
            .unwrap_or_else(|e| json!({ "RESULT": "FAIL", "errMsg": e.to_string() }));
        Self {
            text: value.to_string(),
            json,
            code: if ok { 0 } else { EXIT_DEFAULT_ERROR },
            error: false,
        }
    }

    /// Operation rejected or aborted before producing a response
    pub fn failure(err: &BlockError) -> Self {
        let code = err.exit_code();
        Self {
            text: err.to_string(),
            json: json!({
                "RESULT": "FAIL",
                "errCode": code,
                "errMsg": err.to_string(),
            }),
            code,
            error: true,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == 0
    }

    /// Text or JSON body as printed
    pub fn render(&self, json: bool) -> String {
        if json {
            serde_json::to_string_pretty(&self.json).unwrap_or_else(|_| self.json.to_string())
        } else {
            self.text.clone()
        }
    }

    /// Print to stdout, plain-text errors go to stderr
    pub fn print(&self, json: bool) {
        if json || !self.error {
            println!("{}", self.render(json));
        } else {
            eprintln!("{}", self.render(json));
        }
    }

    pub fn exit_code(&self) -> ExitCode {
        ExitCode::from(u8::try_from(self.code).unwrap_or(u8::MAX))
    }
}
