use lorafit_core::{available_templates, PromptTemplate, BUILTIN_TEMPLATES};

use crate::config::AppConfig;

/// List built-in prompt templates and those found in the template directory.
pub fn run(config: &AppConfig) -> anyhow::Result<()> {
    let dir = config.template_dir();
    let dir = dir.is_dir().then_some(dir.as_path());
    let rows = template_rows(dir);

    println!("{:<20} {:<10} {}", "NAME", "SOURCE", "DESCRIPTION");
    println!("{}", "-".repeat(72));
    for (name, source, description) in &rows {
        println!("{:<20} {:<10} {}", name, source, description);
    }
    match dir {
        Some(d) => println!("\n{} template(s); files read from {}", rows.len(), d.display()),
        None => println!("\n{} template(s); template dir '{}' not found", rows.len(), config.templates.dir),
    }
    Ok(())
}

/// `(name, source, description)` for every available template.  Files that
/// fail to load are listed with the error as their description.
fn template_rows(dir: Option<&std::path::Path>) -> Vec<(String, &'static str, String)> {
    available_templates(dir)
        .into_iter()
        .map(|name| {
            let from_file = dir.is_some_and(|d| d.join(format!("{name}.json")).is_file());
            let source = match (from_file, BUILTIN_TEMPLATES.contains(&name.as_str())) {
                (true, true) => "file*",
                (true, false) => "file",
                _ => "built-in",
            };
            let description = match PromptTemplate::load(&name, dir) {
                Ok(t) => t.description.clone(),
                Err(e) => format!("error: {e}"),
            };
            (name, source, description)
        })
        .collect()
}
