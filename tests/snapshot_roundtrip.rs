//! Capturing an entity and restoring it reproduces every captured field.

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;

use tigris_antinuke::antinuke::ActionKind;
use tigris_antinuke::antinuke::restore::Restorer;
use tigris_antinuke::antinuke::snapshot::{
    ChannelSnapshot, EntityAttributes, EntitySnapshot, MemberSnapshot, OverwriteSnapshot,
    RoleSnapshot, ServerSnapshot,
};
use tigris_antinuke::db::{GuardStore, MemoryStore};
use tigris_antinuke::ratelimit::CallExecutor;
use tigris_antinuke::testing::MockPlatform;

const GUILD: u64 = 1;

fn overwrite() -> impl Strategy<Value = OverwriteSnapshot> {
    (1u64..1_000_000, 0u8..2, any::<u64>(), any::<u64>()).prop_map(|(id, kind, allow, deny)| {
        OverwriteSnapshot {
            id,
            kind,
            allow,
            deny,
        }
    })
}

fn channel() -> impl Strategy<Value = ChannelSnapshot> {
    (
        (1u64..800_000, "[a-z0-9-]{1,24}", prop_oneof![Just(0u8), Just(2u8), Just(5u8)]),
        (proptest::option::of("[ -~]{0,60}"), any::<bool>()),
        (
            proptest::option::of(8_000u32..96_000),
            proptest::option::of(0u32..100),
            proptest::option::of(0u16..21_600),
        ),
        (0i64..200, proptest::option::of(1u64..1_000_000)),
        proptest::collection::vec(overwrite(), 0..4),
    )
        .prop_map(
            |((id, name, kind), (topic, nsfw), (bitrate, user_limit, slow), (position, parent_id), ow)| {
                ChannelSnapshot {
                    id,
                    name,
                    kind,
                    topic,
                    nsfw,
                    bitrate,
                    user_limit,
                    rate_limit_per_user: slow,
                    position,
                    parent_id,
                    permission_overwrites: ow,
                }
            },
        )
}

fn role() -> impl Strategy<Value = RoleSnapshot> {
    (
        (1u64..1_000_000, "[ -~]{1,32}", 0u32..0x00ff_ffff),
        (any::<bool>(), 0i64..250, any::<u64>(), any::<bool>()),
        (
            proptest::option::of("[0-9a-f]{32}"),
            proptest::option::of(Just("🛡️".to_string())),
        ),
    )
        .prop_map(
            |((id, name, colour), (hoist, position, permissions, mentionable), (icon, unicode_emoji))| {
                RoleSnapshot {
                    id,
                    name,
                    colour,
                    hoist,
                    position,
                    permissions,
                    mentionable,
                    icon,
                    unicode_emoji,
                }
            },
        )
}

fn server() -> impl Strategy<Value = ServerSnapshot> {
    ("[ -~]{2,40}", 0u8..5, 0u8..3, 0u8..2, 0u8..2).prop_map(|(name, vl, ecf, dmn, mfa)| {
        ServerSnapshot {
            name,
            verification_level: vl,
            explicit_content_filter: ecf,
            default_message_notifications: dmn,
            mfa_level: mfa,
            vanity_code: None,
        }
    })
}

fn restorer(p: &Arc<MockPlatform>, store: &Arc<MemoryStore>) -> Restorer {
    Restorer::new(
        p.clone(),
        CallExecutor::new(),
        store.clone(),
        Duration::ZERO,
        60_000,
    )
}

fn run<F: std::future::Future>(f: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
        .block_on(f)
}

async fn capture_and_restore(
    p: &Arc<MockPlatform>,
    entity_id: u64,
    cause: ActionKind,
    attrs: EntityAttributes,
) {
    let store = Arc::new(MemoryStore::new());
    store
        .save_snapshot(&EntitySnapshot::new(GUILD, entity_id, cause, attrs))
        .await
        .expect("save");
    let report = restorer(p, &store).restore(GUILD, cause, 7).await;
    assert_eq!((report.succeeded, report.failed), (1, 0));
    assert_eq!(store.snapshot_count().await, 0);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn deleted_channel_comes_back_identical(c in channel()) {
        let p = MockPlatform::new(100);
        run(capture_and_restore(&p, c.id, ActionKind::ChannelDelete, EntityAttributes::Channel(c.clone())));
        let state = p.state();
        prop_assert_eq!(state.channels.len(), 1);
        let mut created = state.channels.values().next().cloned().expect("created");
        prop_assert_ne!(created.id, c.id);
        created.id = c.id;
        prop_assert_eq!(created, c);
    }

    #[test]
    fn edited_channel_is_put_back(c in channel(), renamed in "[a-z]{1,10}") {
        let p = MockPlatform::new(100);
        p.state().channels.insert(c.id, ChannelSnapshot { name: renamed, permission_overwrites: vec![], ..c.clone() });
        run(capture_and_restore(&p, c.id, ActionKind::ChannelUpdate, EntityAttributes::Channel(c.clone())));
        let state = p.state();
        prop_assert_eq!(state.channels.get(&c.id), Some(&c));
    }

    #[test]
    fn deleted_role_comes_back_identical(r in role()) {
        let p = MockPlatform::new(100);
        run(capture_and_restore(&p, r.id, ActionKind::RoleDelete, EntityAttributes::Role(r.clone())));
        let state = p.state();
        let mut created = state.roles.values().next().cloned().expect("created");
        created.id = r.id;
        prop_assert_eq!(created, r);
    }

    #[test]
    fn edited_role_is_put_back(r in role()) {
        let p = MockPlatform::new(100);
        p.state().roles.insert(r.id, RoleSnapshot { permissions: u64::MAX, ..r.clone() });
        run(capture_and_restore(&p, r.id, ActionKind::RoleUpdate, EntityAttributes::Role(r.clone())));
        let state = p.state();
        prop_assert_eq!(state.roles.get(&r.id), Some(&r));
    }

    #[test]
    fn member_roles_are_put_back(user in 1u64..1_000_000, roles in proptest::collection::vec(1u64..1_000_000, 0..8)) {
        let p = MockPlatform::new(100);
        let snap = MemberSnapshot { user_id: user, role_ids: roles.clone() };
        run(capture_and_restore(&p, user, ActionKind::MemberUpdate, EntityAttributes::Member(snap)));
        let state = p.state();
        prop_assert_eq!(state.member_roles.get(&user), Some(&roles));
    }

    #[test]
    fn server_settings_are_put_back(wanted in server(), current in server()) {
        let p = MockPlatform::new(100);
        p.state().server = Some(current);
        run(capture_and_restore(&p, GUILD, ActionKind::ServerUpdate, EntityAttributes::Server(wanted.clone())));
        let state = p.state();
        prop_assert_eq!(state.server.clone(), Some(wanted));
    }
}
