#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;

use crate::error::MiniToolsError;

/// Package manager families the update check knows how to drive.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    Apt,
    Dnf,
    Pacman,
    Zypper,
}

impl PackageManager {
    /// Read-only "what would upgrade" query for this family.
    #[must_use]
    pub fn update_check_command(self) -> Vec<String> {
        let argv: &[&str] = match self {
            Self::Apt => &["apt", "list", "--upgradable"],
            Self::Dnf => &["dnf", "check-update", "--quiet"],
            Self::Pacman => &["checkupdates"],
            Self::Zypper => &["zypper", "list-updates", "--type", "patch"],
        };
        argv.iter().map(|s| (*s).to_owned()).collect()
    }

    /// Apply all pending updates. Runs through `pkexec sh -c` because the
    /// apt family needs a refresh-then-upgrade compound.
    #[must_use]
    pub fn update_apply_command(self) -> Vec<String> {
        let script = match self {
            Self::Apt => "apt update && apt upgrade -y",
            Self::Dnf => "dnf upgrade -y",
            Self::Pacman => "pacman -Syu --noconfirm",
            Self::Zypper => "zypper dup -y",
        };
        str_vec(&["pkexec", "sh", "-c", script])
    }
}

/// Map an os-release `ID` to its package manager family.
#[must_use]
pub fn package_manager_for(distro_id: &str) -> Option<PackageManager> {
    match distro_id {
        "ubuntu" | "debian" | "mint" | "pop" | "zorin" | "elementary" | "pikaos" => {
            Some(PackageManager::Apt)
        }
        "fedora" | "nobara" | "rhel" | "centos" => Some(PackageManager::Dnf),
        "arch" | "cachyos" | "manjaro" | "endeavouros" | "xerolinux" | "garuda" => {
            Some(PackageManager::Pacman)
        }
        "opensuse" | "suse" => Some(PackageManager::Zypper),
        _ => None,
    }
}

/// `ID=` value from an os-release file body. PikaOS reports `pika`.
#[must_use]
pub fn parse_os_release_id(body: &str) -> Option<String> {
    for line in body.lines() {
        if let Some(value) = line.strip_prefix("ID=") {
            let id = value.trim().trim_matches('"').to_lowercase();
            if id == "pika" {
                return Some("pikaos".to_owned());
            }
            return Some(id);
        }
    }
    None
}

pub fn detect_distro_id() -> Option<String> {
    let body = std::fs::read_to_string("/etc/os-release").ok()?;
    parse_os_release_id(&body)
}

/// One built-in maintenance operation. The command is an argv template;
/// `{name}` placeholders are filled from caller-supplied parameters at
/// request time.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Action {
    pub identifier: String,
    pub display_name: String,
    pub command: Vec<String>,
    pub requires_elevation: bool,
}

impl Action {
    fn new(identifier: &str, display_name: &str, command: Vec<String>, elevated: bool) -> Self {
        Self {
            identifier: identifier.to_owned(),
            display_name: display_name.to_owned(),
            command,
            requires_elevation: elevated,
        }
    }

    /// Substitute `{key}` placeholders in the command template. A template
    /// argument the parameter map does not cover is an error; extra
    /// parameters are ignored.
    pub fn resolve(
        &self,
        params: &BTreeMap<String, String>,
    ) -> Result<Vec<String>, MiniToolsError> {
        self.command
            .iter()
            .map(|arg| {
                let Some(key) = arg.strip_prefix('{').and_then(|s| s.strip_suffix('}')) else {
                    return Ok(arg.clone());
                };
                params
                    .get(key)
                    .cloned()
                    .ok_or_else(|| MiniToolsError::MissingParameter(key.to_owned()))
            })
            .collect()
    }
}

/// Static registry of built-ins, populated once at startup and never
/// mutated afterwards.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    actions: Vec<Action>,
}

impl Catalog {
    /// Catalog for the running system. The update check is resolved against
    /// the detected distribution; on an unrecognized distribution that
    /// entry is absent (there is no command we could safely guess).
    #[must_use]
    pub fn builtin() -> Self {
        Self::for_distro(detect_distro_id().as_deref())
    }

    #[must_use]
    pub fn for_distro(distro_id: Option<&str>) -> Self {
        let mut actions = Vec::new();

        if let Some(pm) = distro_id.and_then(package_manager_for) {
            actions.push(Action::new(
                "update-check",
                "Check System Updates",
                pm.update_check_command(),
                false,
            ));
            actions.push(Action::new(
                "system-update",
                "Apply System Updates",
                pm.update_apply_command(),
                true,
            ));
        }

        actions.push(Action::new(
            "flatpak-check",
            "Check Flatpak Updates",
            str_vec(&["flatpak", "remote-ls", "--updates"]),
            false,
        ));
        actions.push(Action::new(
            "flatpak-update",
            "Update Flatpak Apps",
            str_vec(&["flatpak", "update", "-y"]),
            false,
        ));
        actions.push(Action::new(
            "flatpak-remove-unused",
            "Remove Unused Flatpak Runtimes",
            str_vec(&["flatpak", "uninstall", "--unused", "-y"]),
            false,
        ));
        actions.push(Action::new(
            "uuid-change",
            "Change Partition UUID",
            str_vec(&["pkexec", "{tool}", "{uuid_flag}", "{uuid}", "{device}"]),
            true,
        ));

        Self { actions }
    }

    #[must_use]
    pub fn lookup(&self, identifier: &str) -> Option<&Action> {
        self.actions.iter().find(|a| a.identifier == identifier)
    }

    #[must_use]
    pub fn actions(&self) -> &[Action] {
        &self.actions
    }
}

/// Parameters for the `uuid-change` template: maps the partition's
/// filesystem to the tool that can rewrite its UUID. FAT has no in-place
/// UUID rewrite, and anything unrecognized is refused rather than guessed.
pub fn uuid_change_params(
    filesystem: &str,
    device: &str,
    new_uuid: &str,
) -> Result<BTreeMap<String, String>, MiniToolsError> {
    let (tool, flag) = match filesystem {
        "ext2" | "ext3" | "ext4" => ("tune2fs", "-U"),
        "xfs" => ("xfs_admin", "-U"),
        "btrfs" => ("btrfstune", "-u"),
        "swap" => ("mkswap", "-U"),
        other => return Err(MiniToolsError::UnsupportedFilesystem(other.to_owned())),
    };

    let mut params = BTreeMap::new();
    params.insert("tool".to_owned(), tool.to_owned());
    params.insert("uuid_flag".to_owned(), flag.to_owned());
    params.insert("uuid".to_owned(), new_uuid.to_owned());
    params.insert("device".to_owned(), device.to_owned());
    Ok(params)
}

/// Command used to probe a partition's filesystem type before a UUID
/// change. Needs elevation for unmounted partitions, hence pkexec.
#[must_use]
pub fn probe_filesystem_command(device: &str) -> Vec<String> {
    str_vec(&["pkexec", "blkid", "-o", "value", "-s", "TYPE", device])
}

pub fn validate_block_device(device: &str) -> Result<(), MiniToolsError> {
    if !device.starts_with("/dev/") {
        return Err(MiniToolsError::Other(format!(
            "invalid partition device '{device}': must start with /dev/"
        )));
    }
    if !Path::new(device).exists() {
        return Err(MiniToolsError::Other(format!(
            "partition device '{device}' does not exist"
        )));
    }
    Ok(())
}

fn str_vec(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| (*s).to_owned()).collect()
}
