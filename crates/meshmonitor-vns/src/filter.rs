//! Admin-command filter for virtual-node clients
//!
//! Native client apps assume they own the radio; connected through the
//! virtual node server they must not reconfigure it for everyone else.
//! The filter is default-deny for the blocked ports, with one carve-out:
//! favorite bookkeeping, which is both forwarded and mirrored locally so
//! the web UI agrees with the device.

use meshmonitor_proto::admin::{admin_message, decode_admin};
use meshmonitor_proto::mesh::MeshPacket;
use meshmonitor_proto::portnum::{normalize, PortNum};

/// Store mirror accompanying an allowed admin command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorOp {
    SetFavorite { node_num: u32, favorite: bool },
}

/// Outcome of filtering one client packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterVerdict {
    Forward,
    /// Forward to the radio and apply the mirror to the store.
    ForwardWithMirror(MirrorOp),
    /// Silently drop; the reason and decoded subcommand go to the audit
    /// log, never back to the client.
    Drop {
        reason: &'static str,
        subcommand: Option<&'static str>,
    },
}

/// Ports a virtual-node client may not use to reach other nodes.
const BLOCKED_PORTS: [PortNum; 2] = [PortNum::AdminApp, PortNum::NodeinfoApp];

/// Judge one outbound packet from a client.
pub fn evaluate(packet: &MeshPacket, allow_admin_commands: bool) -> FilterVerdict {
    let Some(data) = packet.decoded() else {
        // Channel/PKI-encrypted payload: the port is not visible, and the
        // radio enforces its own admin auth on encrypted commands.
        return FilterVerdict::Forward;
    };

    let port = normalize(data.portnum);
    if !BLOCKED_PORTS.iter().any(|p| *p as i32 == port) {
        return FilterVerdict::Forward;
    }

    if allow_admin_commands {
        return FilterVerdict::Forward;
    }

    // A device querying itself is harmless.
    if packet.from == packet.to {
        return FilterVerdict::Forward;
    }

    if port == PortNum::NodeinfoApp as i32 {
        return FilterVerdict::Drop {
            reason: "nodeinfo_blocked",
            subcommand: None,
        };
    }

    let Ok(admin) = decode_admin(&data.payload) else {
        return FilterVerdict::Drop {
            reason: "undecodable_admin",
            subcommand: None,
        };
    };

    match admin.payload_variant {
        Some(admin_message::PayloadVariant::SetFavoriteNode(node_num)) => {
            FilterVerdict::ForwardWithMirror(MirrorOp::SetFavorite {
                node_num,
                favorite: true,
            })
        }
        Some(admin_message::PayloadVariant::RemoveFavoriteNode(node_num)) => {
            FilterVerdict::ForwardWithMirror(MirrorOp::SetFavorite {
                node_num,
                favorite: false,
            })
        }
        Some(variant) => FilterVerdict::Drop {
            reason: "admin_denied",
            subcommand: Some(variant.name()),
        },
        None => FilterVerdict::Drop {
            reason: "admin_denied",
            subcommand: Some("empty"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshmonitor_proto::admin::AdminMessage;
    use meshmonitor_proto::mesh::{Data, User};
    use meshmonitor_proto::Message as _;

    fn admin_packet(from: u32, to: u32, admin: AdminMessage) -> MeshPacket {
        MeshPacket::admin(from, to, 100, admin.encode_to_vec())
    }

    #[test]
    fn test_plain_traffic_forwards() {
        let packet = MeshPacket::text_message(0x10, 0xFFFF_FFFF, 0, 1, "hi", 0, false);
        assert_eq!(evaluate(&packet, false), FilterVerdict::Forward);

        let packet = MeshPacket::traceroute_request(0x10, 0x20, 0, 2);
        assert_eq!(evaluate(&packet, false), FilterVerdict::Forward);
    }

    #[test]
    fn test_favorite_commands_forward_with_mirror() {
        let packet = admin_packet(0x10, 0x20, AdminMessage::set_favorite_node(0x30, &[]));
        assert_eq!(
            evaluate(&packet, false),
            FilterVerdict::ForwardWithMirror(MirrorOp::SetFavorite {
                node_num: 0x30,
                favorite: true
            })
        );

        let packet = admin_packet(0x10, 0x20, AdminMessage::remove_favorite_node(0x30, &[]));
        assert_eq!(
            evaluate(&packet, false),
            FilterVerdict::ForwardWithMirror(MirrorOp::SetFavorite {
                node_num: 0x30,
                favorite: false
            })
        );
    }

    #[test]
    fn test_other_admin_dropped_with_subcommand() {
        let owner = User {
            long_name: "pwned".to_string(),
            ..Default::default()
        };
        let packet = admin_packet(0x10, 0x20, AdminMessage::set_owner(owner, &[]));
        assert_eq!(
            evaluate(&packet, false),
            FilterVerdict::Drop {
                reason: "admin_denied",
                subcommand: Some("setOwner"),
            }
        );
    }

    #[test]
    fn test_self_addressed_admin_allowed() {
        let owner = User::default();
        let packet = admin_packet(0x20, 0x20, AdminMessage::set_owner(owner, &[]));
        assert_eq!(evaluate(&packet, false), FilterVerdict::Forward);
    }

    #[test]
    fn test_nodeinfo_to_other_node_dropped() {
        let mut packet = MeshPacket::text_message(0x10, 0x20, 0, 3, "", 0, false);
        if let Some(meshmonitor_proto::mesh::mesh_packet::PayloadVariant::Decoded(data)) =
            &mut packet.payload_variant
        {
            data.portnum = PortNum::NodeinfoApp as i32;
        }
        assert_eq!(
            evaluate(&packet, false),
            FilterVerdict::Drop {
                reason: "nodeinfo_blocked",
                subcommand: None,
            }
        );
    }

    #[test]
    fn test_undecodable_admin_dropped() {
        let packet = MeshPacket {
            from: 0x10,
            to: 0x20,
            id: 4,
            payload_variant: Some(
                meshmonitor_proto::mesh::mesh_packet::PayloadVariant::Decoded(Data {
                    portnum: PortNum::AdminApp as i32,
                    payload: vec![0xFF, 0xFF, 0xFF],
                    ..Default::default()
                }),
            ),
            ..Default::default()
        };
        assert_eq!(
            evaluate(&packet, false),
            FilterVerdict::Drop {
                reason: "undecodable_admin",
                subcommand: None,
            }
        );
    }

    #[test]
    fn test_operator_override_allows_everything() {
        let owner = User::default();
        let packet = admin_packet(0x10, 0x20, AdminMessage::set_owner(owner, &[]));
        assert_eq!(evaluate(&packet, true), FilterVerdict::Forward);
    }

    #[test]
    fn test_encrypted_payload_forwards() {
        let packet = MeshPacket {
            from: 0x10,
            to: 0x20,
            id: 5,
            payload_variant: Some(
                meshmonitor_proto::mesh::mesh_packet::PayloadVariant::Encrypted(vec![9, 9, 9]),
            ),
            ..Default::default()
        };
        assert_eq!(evaluate(&packet, false), FilterVerdict::Forward);
    }
}
