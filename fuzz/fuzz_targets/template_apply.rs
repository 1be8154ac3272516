#![no_main]

use std::collections::BTreeMap;

use libfuzzer_sys::fuzz_target;
use shipwright::context::TemplateContext;
use shipwright::types::GitInfo;

fuzz_target!(|data: &str| {
    let ctx = TemplateContext::new("widget", &GitInfo::synthetic(), "1.0.0", BTreeMap::new());
    // Must never panic, only return a render error.
    let _ = ctx.apply(data);
});
