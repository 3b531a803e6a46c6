#![allow(dead_code)]

use serde_json::json;

use convergent::template::Template;
use convergent_test_utils::builders::{get_attr, get_resource, ResourceBuilder, TemplateBuilder};
use convergent_test_utils::fake_plugin::SCRIPTED_TYPE;

pub use convergent_test_utils::init_tracing;

pub fn scripted() -> ResourceBuilder {
    ResourceBuilder::new(SCRIPTED_TYPE)
}

/// `net <- subnet <- server`, each referencing its predecessor.
pub fn chain_template() -> Template {
    TemplateBuilder::new()
        .resource("net", scripted().property("cidr", json!("10.0.0.0/16")))
        .resource(
            "subnet",
            scripted()
                .property("network", get_resource("net"))
                .property("cidr", json!("10.0.1.0/24")),
        )
        .resource(
            "server",
            scripted()
                .property("subnet", get_resource("subnet"))
                .property("network_name", get_attr("net", "name"))
                .property("flavor", json!("small")),
        )
        .build()
}

/// Names of the current rows of a status view, sorted.
pub fn names(view: &convergent::engine::StackStatusView) -> Vec<String> {
    let mut names: Vec<String> = view
        .resources
        .iter()
        .filter(|r| r.current)
        .map(|r| r.name.clone())
        .collect();
    names.sort();
    names
}
