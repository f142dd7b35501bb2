//! TAP Manager (T): per-VM TAP device lifecycle, MAC derivation, and the
//! bridge ARP hygiene needed when an IP is recycled to a new VM.

use tracing::info;

use crate::command::{self, Privilege};
use crate::config::{
    BRIDGE_GATEWAY_IP, BRIDGE_NAME, HostNetworkConfig, VM_SUBNET_NETMASK,
};
use crate::error::NetError;
use crate::pool::{IpPool, tap_device_name};
use crate::proxy;

/// A locally-administered MAC address derived deterministically from a
/// `VmId`. The first three octets are the fixed `02:00:00` OUI; the last
/// three are a 32-bit rolling hash of the `vm_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    /// `02:00:00:XX:XX:XX`, last 3 bytes from `hash(vm_id)`.
    ///
    /// Hash: `h = 31*h + byte` over each byte of `vm_id`, accumulated in a
    /// `u32` (so it wraps exactly like the masked-32-bit arithmetic the
    /// design specifies), then the three low bytes of `h` — `(h>>16)&0xff`,
    /// `(h>>8)&0xff`, `h&0xff` — become the locally-administered suffix.
    pub fn for_vm_id(vm_id: &str) -> Self {
        let mut h: u32 = 0;
        for byte in vm_id.bytes() {
            h = h.wrapping_mul(31).wrapping_add(u32::from(byte));
        }
        MacAddr([
            0x02,
            0x00,
            0x00,
            ((h >> 16) & 0xff) as u8,
            ((h >> 8) & 0xff) as u8,
            (h & 0xff) as u8,
        ])
    }

    pub fn to_colon_hex(self) -> String {
        self.0
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(":")
    }
}

impl std::fmt::Display for MacAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_colon_hex())
    }
}

/// `tap<first 8 chars of vm_id>` — re-exported from [`crate::pool`] so
/// callers only need to import [`crate::tap`] for everything TAP-shaped.
pub fn tap_name(vm_id: &str) -> String {
    tap_device_name(vm_id)
}

/// Boot parameters a caller injects into the guest kernel command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapHandle {
    pub tap_name: String,
    pub mac: String,
    pub ip: String,
    pub gateway: String,
    pub netmask: String,
}

impl TapHandle {
    /// `ip=<guest>::<gw>:<mask>:vm0-guest:eth0:off`, the Linux kernel boot
    /// argument format that makes `eth0` auto-configure at guest boot.
    pub fn boot_arg(&self) -> String {
        format!(
            "ip={}::{}:{}:vm0-guest:eth0:off",
            self.ip, self.gateway, self.netmask
        )
    }
}

/// TAP Manager over a [`HostNetworkConfig`] and its backing [`IpPool`].
pub struct TapManager<'a> {
    config: &'a HostNetworkConfig,
}

impl<'a> TapManager<'a> {
    pub fn new(config: &'a HostNetworkConfig) -> Self {
        Self { config }
    }

    /// Allocate an IP, create the TAP, enslave it to the bridge, and return
    /// the guest boot parameters.
    ///
    /// On any failure after the IP is allocated, the caller must invoke
    /// [`TapManager::delete_tap`] with that IP to release it — creation is
    /// transactional only from the caller's point of view, not internally.
    pub async fn create_tap(&self, vm_id: &str) -> Result<TapHandle, NetError> {
        let pool = IpPool::new(self.config);
        let ip = pool.allocate(vm_id).await?;
        let name = tap_name(vm_id);
        let mac = MacAddr::for_vm_id(vm_id);

        // Defensive cleanup: a previous VM that held this recycled IP may
        // have left PREROUTING nat rules scoped to it.
        proxy::clear_rules_for_source(&ip).await;

        if self.tap_exists(&name).await? {
            info!(tap = %name, "tap already exists, recreating");
            command::exec_ignore_errors("ip", &["link", "del", &name], Privilege::Sudo).await;
        }

        command::exec(
            "ip",
            &["tuntap", "add", "dev", &name, "mode", "tap"],
            Privilege::Sudo,
        )
        .await?;
        command::exec(
            "ip",
            &["link", "set", &name, "master", BRIDGE_NAME],
            Privilege::Sudo,
        )
        .await?;
        command::exec("ip", &["link", "set", &name, "up"], Privilege::Sudo).await?;

        info!(vm_id, tap = %name, ip = %ip, mac = %mac, "tap created");

        Ok(TapHandle {
            tap_name: name,
            mac: mac.to_colon_hex(),
            ip,
            gateway: BRIDGE_GATEWAY_IP.to_string(),
            netmask: VM_SUBNET_NETMASK.to_string(),
        })
    }

    /// Delete the TAP (if present), flush its ARP entry on the bridge (if
    /// an IP was supplied), and release the IP.
    ///
    /// Every sub-step is best-effort except IP release: the goal is an
    /// absent resource, and a missing TAP or ARP entry already satisfies
    /// that goal.
    pub async fn delete_tap(&self, tap_name: &str, ip: Option<&str>) -> Result<(), NetError> {
        if self.tap_exists(tap_name).await? {
            command::exec_ignore_errors("ip", &["link", "del", tap_name], Privilege::Sudo).await;
        }

        if let Some(ip) = ip {
            command::exec_ignore_errors(
                "ip",
                &["neigh", "del", ip, "dev", BRIDGE_NAME],
                Privilege::Sudo,
            )
            .await;

            let pool = IpPool::new(self.config);
            pool.release(ip).await?;
        }

        info!(tap = tap_name, ip = ip.unwrap_or("-"), "tap deleted");
        Ok(())
    }

    async fn tap_exists(&self, name: &str) -> Result<bool, NetError> {
        command::check("ip", &["link", "show", name], Privilege::Sudo).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_starts_with_locally_administered_oui() {
        let mac = MacAddr::for_vm_id("11112222aaaabbbb");
        assert!(mac.to_colon_hex().starts_with("02:00:00:"));
    }

    #[test]
    fn mac_is_deterministic() {
        let a = MacAddr::for_vm_id("some-vm-id");
        let b = MacAddr::for_vm_id("some-vm-id");
        assert_eq!(a, b);
    }

    #[test]
    fn mac_differs_across_vm_ids() {
        let a = MacAddr::for_vm_id("vm-one");
        let b = MacAddr::for_vm_id("vm-two");
        assert_ne!(a, b);
    }

    #[test]
    fn mac_parses_as_six_hex_octets() {
        let mac = MacAddr::for_vm_id("11112222aaaabbbb");
        let parts: Vec<&str> = mac.to_colon_hex().split(':').collect();
        assert_eq!(parts.len(), 6);
        for part in parts {
            assert_eq!(part.len(), 2);
            assert!(u8::from_str_radix(part, 16).is_ok());
        }
    }

    #[test]
    fn mac_of_empty_vm_id_is_well_defined() {
        let mac = MacAddr::for_vm_id("");
        assert_eq!(mac.to_colon_hex(), "02:00:00:00:00:00");
    }

    #[test]
    fn tap_name_matches_pool_derivation() {
        assert_eq!(tap_name("11112222aaaabbbb"), "tap11112222");
    }

    #[test]
    fn tap_name_length_within_kernel_limit() {
        // Worst case: vm_id at least 8 chars, "tap" + 8 = 11 bytes, well
        // under IFNAMSIZ's 15-byte (16 with NUL) limit.
        let name = tap_name("ffffffffffffffffffffffff");
        assert!(name.len() <= 15);
    }

    #[test]
    fn boot_arg_matches_kernel_ip_format() {
        let handle = TapHandle {
            tap_name: "tap11112222".to_string(),
            mac: "02:00:00:01:02:03".to_string(),
            ip: "172.16.0.2".to_string(),
            gateway: BRIDGE_GATEWAY_IP.to_string(),
            netmask: VM_SUBNET_NETMASK.to_string(),
        };
        assert_eq!(
            handle.boot_arg(),
            "ip=172.16.0.2::172.16.0.1:255.255.255.0:vm0-guest:eth0:off"
        );
    }
}
