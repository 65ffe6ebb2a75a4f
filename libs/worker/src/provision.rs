//! Volumes for a new container.
//!
//! Every container gets, in order:
//!
//! 1. an empty scratch volume
//! 2. an empty working-directory volume, unless an input or output is
//!    already mounted there
//! 3. one volume per input and per output path, sorted by mount path so a
//!    parent directory is always mounted before anything nested in it
//!
//! No two volumes share a mount path. An output at the same path as an
//! input or the scratch volume shares that volume; an input at the scratch
//! path is rejected.

use std::collections::HashSet;

use anyhow::{bail, Result};
use tracing::{debug, instrument};

use crate::state::ContainerRecord;
use crate::types::ContainerSpec;
use crate::volume::{VolumeMount, VolumeSpec};
use crate::worker::Worker;

impl Worker {
    /// Create the volumes `spec` needs, all inheriting `privileged` from the
    /// container's image.
    ///
    /// The first failure aborts provisioning; volumes created before it are
    /// left to the volume service's collection of the failed container.
    #[instrument(skip_all, fields(worker = %self.name(), container = %container.handle))]
    pub async fn provision_volumes(
        &self,
        privileged: bool,
        container: &ContainerRecord,
        spec: &ContainerSpec,
    ) -> Result<Vec<VolumeMount>> {
        let volumes = &self.services().volumes;

        let input_paths: Vec<String> = spec
            .inputs
            .iter()
            .map(|input| clean_path(&input.destination_path))
            .collect();
        let output_paths: Vec<String> = spec.outputs.iter().map(|p| clean_path(p)).collect();

        let scratch_path = clean_path(self.scratch_path());

        let mut claimed: HashSet<String> = HashSet::new();
        claimed.insert(scratch_path.clone());
        for path in &input_paths {
            if !claimed.insert(path.clone()) {
                bail!("multiple volumes mounted at {path}");
            }
        }

        let mut volume_mounts = Vec::new();

        let scratch = volumes
            .find_or_create_volume_for_container(
                &VolumeSpec::empty(privileged),
                container,
                spec.team_id,
                &scratch_path,
            )
            .await?;
        volume_mounts.push(VolumeMount {
            volume: scratch,
            mount_path: scratch_path,
        });

        if let Some(dir) = &spec.dir {
            let dir = clean_path(dir);
            if !claimed.contains(&dir) && !output_paths.contains(&dir) {
                let workdir = volumes
                    .find_or_create_volume_for_container(
                        &VolumeSpec::empty(privileged),
                        container,
                        spec.team_id,
                        &dir,
                    )
                    .await?;
                volume_mounts.push(VolumeMount {
                    volume: workdir,
                    mount_path: dir,
                });
            }
        }

        let mut io_mounts = Vec::new();

        for (input, mount_path) in spec.inputs.iter().zip(&input_paths) {
            let volume = match input.source.volume_on(self).await? {
                Some(local) => {
                    debug!(parent = %local.handle, mount_path = %mount_path, "Reusing local volume for input");
                    volumes
                        .find_or_create_cow_volume_for_container(
                            &VolumeSpec {
                                strategy: local.cow_strategy(),
                                privileged,
                            },
                            container,
                            &local,
                            spec.team_id,
                            mount_path,
                        )
                        .await?
                }
                None => {
                    let volume = volumes
                        .find_or_create_volume_for_container(
                            &VolumeSpec::empty(privileged),
                            container,
                            spec.team_id,
                            mount_path,
                        )
                        .await?;

                    debug!(
                        dest_volume = %volume.handle,
                        dest_worker = %volume.worker_name,
                        "Streaming input"
                    );
                    input.source.stream_to(self, &volume).await?;
                    volume
                }
            };

            io_mounts.push(VolumeMount {
                volume,
                mount_path: mount_path.clone(),
            });
        }

        for mount_path in output_paths {
            // Scratch or an input is already mounted here; write to it in place.
            if !claimed.insert(mount_path.clone()) {
                continue;
            }

            let volume = volumes
                .find_or_create_volume_for_container(
                    &VolumeSpec::empty(privileged),
                    container,
                    spec.team_id,
                    &mount_path,
                )
                .await?;
            io_mounts.push(VolumeMount { volume, mount_path });
        }

        io_mounts.sort_by(|a, b| a.mount_path.cmp(&b.mount_path));
        volume_mounts.extend(io_mounts);

        Ok(volume_mounts)
    }
}

/// Lexically normalize a path: collapse repeated separators, drop `.`
/// elements and resolve `..` against the preceding element.
pub fn clean_path(path: &str) -> String {
    let rooted = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();

    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => match parts.last() {
                Some(&last) if last != ".." => {
                    parts.pop();
                }
                _ if rooted => {}
                _ => parts.push(".."),
            },
            _ => parts.push(part),
        }
    }

    match (rooted, parts.is_empty()) {
        (true, true) => "/".to_string(),
        (false, true) => ".".to_string(),
        (true, false) => format!("/{}", parts.join("/")),
        (false, false) => parts.join("/"),
    }
}
