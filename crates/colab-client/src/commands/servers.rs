//! Server assignment commands.

use chrono::Local;
use colab_core::{ColabAssignedServer, ColabServerDescriptor, Variant, server_catalog};
use uuid::Uuid;

use crate::cli::ServersAction;
use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};

pub async fn run(action: ServersAction, config: &ClientConfig) -> ClientResult<()> {
    let manager = super::assignment_manager(config)?;

    match action {
        ServersAction::List { json } => {
            let servers = manager.assigned_servers().await?;
            if json {
                let text = serde_json::to_string_pretty(&servers).map_err(|e| {
                    ClientError::Config(format!("failed to serialize servers: {}", e))
                })?;
                println!("{}", text);
            } else if servers.is_empty() {
                println!("No assigned servers.");
            } else {
                for server in &servers {
                    println!("{}", describe(server));
                }
            }
        }
        ServersAction::Available => {
            for descriptor in manager.available_server_descriptors().await? {
                println!("{}", descriptor);
            }
        }
        ServersAction::Assign {
            variant,
            accelerator,
        } => {
            let descriptor = pick_descriptor(variant, accelerator.as_deref())?;
            let server = manager.assign_server(Uuid::new_v4(), &descriptor).await?;
            println!("Assigned {}", describe(&server));
        }
        ServersAction::Unassign { id } => {
            if manager.unassign_server(id).await? {
                println!("Unassigned {}", id);
            } else {
                return Err(ClientError::Usage(format!("no assigned server with id {}", id)));
            }
        }
        ServersAction::Refresh { id } => {
            let server = manager.refresh_connection(id).await?;
            println!("Refreshed {}", describe(&server));
        }
        ServersAction::Reconcile => {
            let removed = manager.reconcile_assigned_servers().await?;
            println!("{} server(s) removed.", removed.len());
        }
        ServersAction::Latest => {
            let server = manager.latest_or_auto_assign_server().await?;
            println!("{}", describe(&server));
        }
    }

    Ok(())
}

/// The catalog entry for `variant`/`accelerator`.
fn pick_descriptor(
    variant: Variant,
    accelerator: Option<&str>,
) -> ClientResult<ColabServerDescriptor> {
    let catalog = server_catalog();
    let accelerator = match (variant, accelerator) {
        (Variant::Default, _) => None,
        // First accelerator of the family when none was named.
        (_, None) => catalog
            .iter()
            .find(|d| d.variant == variant)
            .and_then(|d| d.accelerator.as_deref()),
        (_, Some(name)) => Some(name),
    };

    catalog
        .iter()
        .find(|d| d.matches(variant, accelerator))
        .cloned()
        .ok_or_else(|| {
            let known: Vec<String> = catalog.iter().map(ToString::to_string).collect();
            ClientError::Usage(format!(
                "unknown server shape {}{}; known shapes:\n  {}",
                variant,
                accelerator.map(|a| format!("/{}", a)).unwrap_or_default(),
                known.join("\n  ")
            ))
        })
}

fn describe(server: &ColabAssignedServer) -> String {
    let info = &server.connection_information;
    let token = if info.is_expired() {
        "token expired".to_string()
    } else {
        format!(
            "token until {}",
            info.token_expiry.with_timezone(&Local).format("%H:%M")
        )
    };
    format!(
        "{}  {}  {}  assigned {}  {}",
        server.id,
        server.descriptor,
        server.endpoint,
        server.date_assigned.with_timezone(&Local).format("%Y-%m-%d %H:%M"),
        token
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_ignores_accelerator() {
        let descriptor = pick_descriptor(Variant::Default, Some("T4")).unwrap();
        assert_eq!(descriptor, colab_core::default_server());
    }

    #[test]
    fn accelerator_is_case_insensitive() {
        let descriptor = pick_descriptor(Variant::Gpu, Some("a100")).unwrap();
        assert_eq!(descriptor.accelerator.as_deref(), Some("A100"));
    }

    #[test]
    fn family_default_is_first_catalog_entry() {
        let descriptor = pick_descriptor(Variant::Tpu, None).unwrap();
        assert_eq!(descriptor.variant, Variant::Tpu);
        assert_eq!(descriptor.accelerator.as_deref(), Some("V5E1"));
    }

    #[test]
    fn unknown_shape_lists_catalog() {
        let err = pick_descriptor(Variant::Gpu, Some("H100")).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("GPU/H100"));
        assert!(message.contains("Colab GPU T4"));
    }
}
