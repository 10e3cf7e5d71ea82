//! Default access-control policy for the coordination server.
//!
//! First install ships a permissive policy: all members may reach all
//! members, and the cluster principal may auto-approve advertised routes for
//! the pod network (each /24 of 10.42.0.0/16) plus the IPv6 service range.

use serde_json::{Map, Value, json};

/// Render the default ACL policy document for `user`.
pub fn default_policy(user: &str) -> String {
    let mut routes = Map::new();
    routes.insert("10.42.0.0/16".to_string(), json!([user]));
    for subnet in 0..255 {
        routes.insert(format!("10.42.{subnet}.0/24"), json!([user]));
    }
    routes.insert("2001:cafe:42::/56".to_string(), json!([user]));

    let policy = json!({
        "acls": [
            { "action": "accept", "src": ["*"], "dst": ["*:*"] }
        ],
        "autoApprovers": {
            "routes": Value::Object(routes),
        },
    });

    serde_json::to_string_pretty(&policy).expect("static policy serializes")
}
