//! Check constructors for use with [`Client::sync_until`]
//!
//! Each constructor captures the identifiers it needs and returns a
//! [`SyncCheck`] closed over them. Checks hold no mutable state; the loop is
//! free to call them against every response and retire them on first pass.
//! Failure messages always name the exact lookup path inspected and whether
//! it was absent, the wrong shape, or present but unmatched.
//!
//! [`Client::sync_until`]: crate::client::Client::sync_until

use ruma::{RoomId, UserId};
use serde_json::Value;

use crate::json;
use crate::sync::SyncCheck;

/// Passes once the timeline of `room_id` (under the `join` section) contains
/// an event accepted by `check`.
pub fn sync_timeline_has(
    room_id: &RoomId,
    check: impl Fn(&Value) -> bool + Send + Sync + 'static,
) -> SyncCheck {
    let room_id = room_id.to_owned();
    Box::new(move |_user_id, envelope| scan_timeline(&room_id, envelope, &check))
}

/// Passes once `user_id` shows up as joined to `room_id`, via the member
/// event in the room's timeline. Failure entries name both the member and
/// the room, so waits on several users in the same room stay apart in a
/// timeout log.
pub fn sync_joined_to(user_id: &UserId, room_id: &RoomId) -> SyncCheck {
    let member = user_id.to_owned();
    let room_id = room_id.to_owned();
    Box::new(move |_client_user_id, envelope| {
        let check_joined = |ev: &Value| {
            json::str_at(ev, "type") == "m.room.member"
                && json::str_at(ev, "state_key") == member.as_str()
                && json::str_at(ev, "content.membership") == "join"
        };
        let key = format!(
            "rooms.join.{}.timeline.events",
            json::escape_key(room_id.as_str())
        );
        scan_array(envelope, &key, &check_joined)
            .map_err(|err| format!("sync_joined_to({member},{room_id}): {err}"))
    })
}

/// Passes once `user_id` shows up as invited to `room_id`.
///
/// An invite surfaces in a different part of the envelope depending on who
/// is syncing: the invited user sees the room under `rooms.invite` with a
/// stripped `invite_state`, while everyone already in the room sees the
/// member event in the ordinary timeline. The two paths are dispatched
/// explicitly on the syncing user's identity.
pub fn sync_invited_to(user_id: &UserId, room_id: &RoomId) -> SyncCheck {
    let invited = user_id.to_owned();
    let room_id = room_id.to_owned();
    Box::new(move |client_user_id, envelope| {
        let check_invited = |ev: &Value| {
            json::str_at(ev, "type") == "m.room.member"
                && json::str_at(ev, "state_key") == invited.as_str()
                && json::str_at(ev, "content.membership") == "invite"
        };
        if client_user_id == &*invited {
            let key = format!(
                "rooms.invite.{}.invite_state.events",
                json::escape_key(room_id.as_str())
            );
            scan_array(envelope, &key, &check_invited)
                .map_err(|err| format!("sync_invited_to({room_id}): {err}"))
        } else {
            scan_timeline(&room_id, envelope, &check_invited)
        }
    })
}

/// Passes once the global account data contains an event accepted by
/// `check`.
pub fn sync_global_account_data_has(
    check: impl Fn(&Value) -> bool + Send + Sync + 'static,
) -> SyncCheck {
    Box::new(move |_user_id, envelope| scan_array(envelope, "account_data.events", &check))
}

fn scan_timeline(
    room_id: &RoomId,
    envelope: &Value,
    check: &dyn Fn(&Value) -> bool,
) -> Result<(), String> {
    let key = format!(
        "rooms.join.{}.timeline.events",
        json::escape_key(room_id.as_str())
    );
    scan_array(envelope, &key, check).map_err(|err| format!("sync_timeline_has({room_id}): {err}"))
}

/// Shared triage for array-scanning checks: the three failure shapes are
/// deliberately distinct so a timeout log tells the reader whether the room
/// never appeared, appeared malformed, or appeared without the expected
/// event.
fn scan_array(envelope: &Value, key: &str, check: &dyn Fn(&Value) -> bool) -> Result<(), String> {
    let value = json::lookup(envelope, key).ok_or_else(|| format!("key {key} does not exist"))?;
    let elements = value
        .as_array()
        .ok_or_else(|| format!("key {key} exists but it isn't an array"))?;
    if elements.iter().any(|ev| check(ev)) {
        return Ok(());
    }
    Err(format!(
        "check function did not pass for {} elements: {}",
        elements.len(),
        json::snippet(&value.to_string())
    ))
}
