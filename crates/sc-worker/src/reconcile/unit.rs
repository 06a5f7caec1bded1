//! systemd unit files for compose deployments

use sc_core::model::ComposeVersion;

/// Default command used to drive docker compose
pub const DEFAULT_COMPOSE_COMMAND: &str = "/usr/bin/docker compose";

/// Render the unit file managing one compose version.
///
/// The output depends only on its arguments, so comparing it with the file
/// on the node tells whether the unit needs rewriting.
pub fn render_unit(compose_name: &str, version: &ComposeVersion, compose_command: &str) -> String {
    let directory = version.directory();
    let service = &version.service_name;
    let compose_file = version.compose_path();

    format!(
        "[Unit]\n\
         Description={compose_name} service with docker compose managed by supercompose\n\
         Requires=docker.service\n\
         After=docker.service\n\
         \n\
         [Service]\n\
         Type=oneshot\n\
         RemainAfterExit=true\n\
         Environment=\"COMPOSE_PROJECT_NAME={service}\"\n\
         Environment=\"COMPOSE_FILE={compose_file}\"\n\
         WorkingDirectory={directory}\n\
         ExecStart={compose_command} --project-directory \"{directory}\" --project-name \"{service}\" up -d --remove-orphans\n\
         ExecStop={compose_command} --project-directory \"{directory}\" --project-name \"{service}\" down\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n"
    )
}

/// Parse `systemctl show` output into its `UnitFileState`
pub fn unit_file_state(show_output: &str) -> Option<&str> {
    show_output
        .lines()
        .filter_map(|line| line.split_once('='))
        .find(|(key, _)| key.trim() == "UnitFileState")
        .map(|(_, value)| value.trim())
}

/// Command querying a unit's enablement
pub fn show_command(unit: &str) -> String {
    format!("systemctl show {} --property=UnitFileState --no-pager", unit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sc_core::{ComposeId, ComposeVersionId};

    fn version(directory: &str) -> ComposeVersion {
        ComposeVersion {
            id: ComposeVersionId::new(),
            compose_id: ComposeId::new(),
            content: String::new(),
            directory: directory.to_string(),
            service_name: "blog".to_string(),
            service_enabled: true,
            created_at: 0,
            redeployment_requested_at: None,
        }
    }

    #[test]
    fn test_render_unit_exact() {
        let expected = "[Unit]
Description=Blog service with docker compose managed by supercompose
Requires=docker.service
After=docker.service

[Service]
Type=oneshot
RemainAfterExit=true
Environment=\"COMPOSE_PROJECT_NAME=blog\"
Environment=\"COMPOSE_FILE=/srv/blog/docker-compose.yml\"
WorkingDirectory=/srv/blog
ExecStart=/usr/bin/docker compose --project-directory \"/srv/blog\" --project-name \"blog\" up -d --remove-orphans
ExecStop=/usr/bin/docker compose --project-directory \"/srv/blog\" --project-name \"blog\" down

[Install]
WantedBy=multi-user.target
";
        assert_eq!(render_unit("Blog", &version("/srv/blog"), DEFAULT_COMPOSE_COMMAND), expected);
    }

    #[test]
    fn test_render_unit_ignores_trailing_slash() {
        assert_eq!(
            render_unit("Blog", &version("/srv/blog/"), DEFAULT_COMPOSE_COMMAND),
            render_unit("Blog", &version("/srv/blog"), DEFAULT_COMPOSE_COMMAND)
        );
    }

    #[test]
    fn test_unit_file_state() {
        assert_eq!(unit_file_state("UnitFileState=enabled\n"), Some("enabled"));
        assert_eq!(
            unit_file_state("Id=blog.service\nUnitFileState=disabled\nActiveState=inactive"),
            Some("disabled")
        );
        assert_eq!(unit_file_state("UnitFileState=\n"), Some(""));
        assert_eq!(unit_file_state("garbage"), None);
    }
}
