//! Fuzz target for request validation.
//!
//! Generates structured node requests and checks that validation and the
//! JSON round trip never panic.

#![no_main]

use arbitrary::Arbitrary;
use congo::node::validate_name;
use congo::protocol::Request;
use congo::{Node, NodeName, parse_key_values};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
enum FuzzRequest {
    Create {
        name: String,
        driver: String,
        params: Vec<(String, String)>,
        ondemand: bool,
    },
    DeleteBulk {
        names: Vec<String>,
    },
    SetState {
        names: Vec<String>,
        state: String,
    },
    /// A `--params` argument as typed on the command line.
    Params {
        raw: String,
    },
}

fuzz_target!(|req: FuzzRequest| {
    let request = match req {
        FuzzRequest::Create {
            name,
            driver,
            params,
            ondemand,
        } => {
            let _ = validate_name(&name);
            let mut node = Node::new(name, driver).with_ondemand(ondemand);
            node.params = params.into_iter().collect();
            Request::Create { node }
        }
        FuzzRequest::DeleteBulk { names } => Request::DeleteBulk {
            nodes: names.into_iter().map(|name| NodeName { name }).collect(),
        },
        FuzzRequest::SetState { names, state } => Request::SetState {
            nodes: names.into_iter().map(|name| NodeName { name }).collect(),
            state,
        },
        FuzzRequest::Params { raw } => {
            let _ = parse_key_values(&raw, ',');
            return;
        }
    };

    if let Ok(json) = serde_json::to_string(&request) {
        let parsed = serde_json::from_str::<Request>(&json);
        assert_eq!(parsed.ok().as_ref(), Some(&request));
    }
});
