//! Text report for a built route map. Pure formatting; all decisions were
//! made by the engine.

use std::fmt::Write;

use crate::engine::RouteMap;

/// One section per service: the service name as a header, then a fenced
/// block listing each root endpoint with its callers indented one tab per
/// hop.
pub fn render_routes(routes: &RouteMap) -> String {
    let mut out = String::new();
    for (service, roots) in routes {
        let _ = writeln!(out, "\n# Routes to Service {service}\n");
        let _ = writeln!(out, "```");
        for root in roots {
            let _ = writeln!(out, "{} ({})", service, root.name);
            for child in root.children.values() {
                let _ = writeln!(out, "\t<- {} ({})", child.service_name, child.name);
                for grand in child.children.values() {
                    let _ = writeln!(out, "\t\t<- {} ({})", grand.service_name, grand.name);
                }
            }
        }
        let _ = writeln!(out, "```");
    }
    out
}
