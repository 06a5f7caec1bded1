//! docker compose invocations for stacks run without systemd

/// Checks that the docker CLI is installed
pub const DOCKER_VERSION_COMMAND: &str = "docker --version";

/// Build a compose command line acting on the stack defined by `compose_path`
pub fn compose_invocation(compose_command: &str, compose_path: &str, args: &str) -> String {
    format!("{} --file '{}' {}", compose_command, compose_path, args)
}

/// Checks that the compose CLI is installed
pub fn compose_version_command(compose_command: &str) -> String {
    format!("{} version", compose_command)
}

/// Whether `compose ps --quiet` output lists any container
pub fn has_containers(ps_output: &str) -> bool {
    !ps_output.trim().is_empty()
}
