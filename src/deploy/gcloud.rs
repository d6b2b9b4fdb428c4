//! Cloud Run command construction
//!
//! Every command is an argument vector handed straight to the process
//! spawner. Values are never interpolated into a shell string, so quoting
//! and injection concerns do not apply.

use super::target::{format_env_vars, DeploymentTarget};

/// Format projection that yields the readiness flag
pub const READY_FORMAT: &str = "value(status.conditions[0].status)";

/// Format projection that yields the public URL
pub const URL_FORMAT: &str = "value(status.url)";

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

fn push_common(args: &mut Vec<String>, target: &DeploymentTarget) {
    args.push("--image".to_string());
    args.push(target.image.to_string());

    args.push("--platform".to_string());
    args.push("managed".to_string());

    args.push("--region".to_string());
    args.push(target.region.clone());

    args.push("--port".to_string());
    args.push(target.port.to_string());

    if target.allow_unauthenticated {
        args.push("--allow-unauthenticated".to_string());
    } else {
        args.push("--no-allow-unauthenticated".to_string());
    }
}

fn push_project(args: &mut Vec<String>, project: Option<&str>) {
    if let Some(project) = project {
        args.push("--project".to_string());
        args.push(project.to_string());
    }
}

/// Generate `gcloud run deploy` arguments for a new service
pub fn generate_deploy_args(target: &DeploymentTarget) -> Vec<String> {
    let mut args = vec!["run".to_string(), "deploy".to_string(), target.name.clone()];

    push_common(&mut args, target);

    if !target.env.is_empty() {
        args.push("--set-env-vars".to_string());
        args.push(format_env_vars(&target.env));
    }

    push_project(&mut args, target.project.as_deref());
    args.push("--quiet".to_string());

    args
}

/// Generate `gcloud run services update` arguments for an existing service
pub fn generate_update_args(target: &DeploymentTarget) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "services".to_string(),
        "update".to_string(),
        target.name.clone(),
    ];

    push_common(&mut args, target);

    if !target.env.is_empty() {
        args.push("--update-env-vars".to_string());
        args.push(format_env_vars(&target.env));
    }

    push_project(&mut args, target.project.as_deref());
    args.push("--quiet".to_string());

    args
}

/// Generate `gcloud run services describe` arguments with a format projection
pub fn generate_describe_args(
    service: &str,
    region: &str,
    project: Option<&str>,
    format: &str,
) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "services".to_string(),
        "describe".to_string(),
        service.to_string(),
        "--region".to_string(),
        region.to_string(),
        "--format".to_string(),
        format.to_string(),
    ];
    push_project(&mut args, project);
    args
}

/// Readiness query for a target
pub fn generate_ready_args(target: &DeploymentTarget) -> Vec<String> {
    generate_describe_args(&target.name, &target.region, target.project.as_deref(), READY_FORMAT)
}

/// URL query for a target
pub fn generate_url_args(target: &DeploymentTarget) -> Vec<String> {
    generate_describe_args(&target.name, &target.region, target.project.as_deref(), URL_FORMAT)
}

/// The readiness flag must be exactly `True`
pub fn parse_ready_flag(stdout: &str) -> bool {
    stdout.lines().next().map(str::trim) == Some("True")
}

/// First non-empty output line, if any
pub fn parse_service_url(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(String::from)
}

/// Render a command for logs without leaking environment values
pub fn redact_args(program: &str, args: &[String]) -> String {
    let mut rendered = vec![program.to_string()];
    let mut hide_next = false;
    for arg in args {
        if hide_next {
            let count = arg.matches('=').count();
            rendered.push(format!("<{} vars>", count));
            hide_next = false;
            continue;
        }
        hide_next = arg == "--set-env-vars" || arg == "--update-env-vars";
        rendered.push(arg.clone());
    }
    rendered.join(" ")
}
