//! The initial data load the server pushes right after validation: the chat
//! list, the contact list, and one `add:*` message frame per unread message.

use log::{debug, warn};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::client::{Client, ClientError};
use crate::request::{HandlerPath, WaitError};
use crate::types::{canonical_jid, Chat, Contact};

/// The server streams chats and contacts lazily; give it room.
const INITIAL_LOAD_DEADLINE: Duration = Duration::from_secs(60);

const ADD_SLOTS: [&str; 3] = ["last", "before", "unread"];

impl Client {
    /// Collects the initial chats, contacts and unread messages.
    ///
    /// Completion needs both the contact list and a chat update flagged
    /// `last`, in either order. Each chat's unread counter meters how many
    /// of the pushed `add:*` frames land in the unread sequence.
    pub async fn receive_chats_and_contacts(
        &self,
    ) -> Result<(Vec<Chat>, Vec<Contact>, Vec<Value>), ClientError> {
        let (updates_tx, mut updates_rx) = mpsc::unbounded_channel();
        for slot in ADD_SLOTS {
            let tx = updates_tx.clone();
            self.register_handler(
                HandlerPath::with_attr("action", "add", slot),
                Box::new(move |payload| {
                    let _ = tx.send((slot, payload.clone()));
                }),
            )
            .await;
        }
        drop(updates_tx);

        let mut chats_rx = self
            .register_structural_waiter(&HandlerPath::with_attr("response", "type", "chat"))
            .await;
        let mut contacts_rx = self
            .register_structural_waiter(&HandlerPath::with_attr("response", "type", "contacts"))
            .await;

        let outcome = tokio::time::timeout(INITIAL_LOAD_DEADLINE, async {
            let mut chats = Vec::new();
            let mut contacts = Vec::new();
            let mut unread_messages = Vec::new();
            let mut remaining_unread: i64 = 0;
            // Updates that raced ahead of the chat list wait for its counters.
            let mut pending: Vec<Value> = Vec::new();
            let mut have_chats = false;
            let mut have_contacts = false;
            let mut have_last = false;

            while !(have_contacts && have_last) {
                tokio::select! {
                    biased;
                    res = &mut chats_rx, if !have_chats => {
                        let payload = res.map_err(|_| WaitError::Cancelled)?;
                        chats = parse_chats(&payload);
                        remaining_unread = chats.iter().map(|c| c.unread_count).sum();
                        debug!(target: "Client", "Received {} chats, {} unread messages expected", chats.len(), remaining_unread);
                        have_chats = true;
                        for payload in pending.drain(..) {
                            if remaining_unread > 0 {
                                remaining_unread -= 1;
                                unread_messages.push(payload);
                            }
                        }
                    }
                    res = &mut contacts_rx, if !have_contacts => {
                        let payload = res.map_err(|_| WaitError::Cancelled)?;
                        contacts = parse_contacts(&payload);
                        debug!(target: "Client", "Received {} contacts", contacts.len());
                        have_contacts = true;
                    }
                    update = updates_rx.recv() => {
                        let Some((slot, payload)) = update else {
                            return Err(WaitError::Cancelled);
                        };
                        if slot == "last" {
                            have_last = true;
                        }
                        if !have_chats {
                            pending.push(payload);
                        } else if remaining_unread > 0 {
                            remaining_unread -= 1;
                            unread_messages.push(payload);
                        }
                    }
                }
            }
            Ok((chats, contacts, unread_messages))
        })
        .await;

        for slot in ADD_SLOTS {
            self.deregister_handler(&HandlerPath::with_attr("action", "add", slot))
                .await;
        }

        match outcome {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                warn!(target: "Client", "Initial data load did not complete in time");
                Err(WaitError::Timeout.into())
            }
        }
    }
}

/// `["response", {"type": "chat"}, [["chat", {jid, name?, count, t}, _], ...]]`
fn parse_chats(payload: &Value) -> Vec<Chat> {
    let mut chats = Vec::new();
    let Some(children) = payload.get(2).and_then(Value::as_array) else {
        return chats;
    };
    for child in children {
        let Some(attrs) = child.get(1).and_then(Value::as_object) else {
            continue;
        };
        let Some(jid) = attrs.get("jid").and_then(Value::as_str) else {
            continue;
        };
        chats.push(Chat {
            jid: canonical_jid(jid),
            name: attrs.get("name").and_then(Value::as_str).map(str::to_string),
            unread_count: parse_count(attrs.get("count")),
            last_activity: attrs.get("t").and_then(attr_i64),
        });
    }
    chats
}

/// `["response", {"type": "contacts"}, [["user", {jid, name?, notify?}, _], ...]]`
fn parse_contacts(payload: &Value) -> Vec<Contact> {
    let mut contacts = Vec::new();
    let Some(children) = payload.get(2).and_then(Value::as_array) else {
        return contacts;
    };
    for child in children {
        let Some(attrs) = child.get(1).and_then(Value::as_object) else {
            continue;
        };
        let Some(jid) = attrs.get("jid").and_then(Value::as_str) else {
            continue;
        };
        contacts.push(Contact {
            jid: canonical_jid(jid),
            name: attrs.get("name").and_then(Value::as_str).map(str::to_string),
            notify: attrs
                .get("notify")
                .and_then(Value::as_str)
                .map(str::to_string),
        });
    }
    contacts
}

/// The unread counter is a decimal string on the wire. Unparsable or
/// negative counts read as zero.
fn parse_count(raw: Option<&Value>) -> i64 {
    raw.and_then(attr_i64).unwrap_or(0).max(0)
}

fn attr_i64(value: &Value) -> Option<i64> {
    match value {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_i64(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::test_client;
    use serde_json::json;

    fn chat_list() -> Value {
        json!(["response", {"type": "chat"}, [
            ["chat", {"jid": "15551234@c.us", "name": "Ada", "count": "2", "t": "1700000000"}, null],
            ["chat", {"jid": "15556789@c.us", "count": "0", "t": "1690000000"}, null],
            ["chat", {"jid": "15550000@c.us", "count": "-3"}, null]
        ]])
    }

    fn contact_list() -> Value {
        json!(["response", {"type": "contacts"}, [
            ["user", {"jid": "15551234@c.us", "name": "Ada", "notify": "ada"}, null],
            ["user", {"jid": "15556789@c.us"}, null]
        ]])
    }

    #[test]
    fn chats_parse_with_clamped_counts() {
        let chats = parse_chats(&chat_list());
        assert_eq!(chats.len(), 3);
        assert_eq!(chats[0].jid, "15551234@s.whatsapp.net");
        assert_eq!(chats[0].unread_count, 2);
        assert_eq!(chats[0].last_activity, Some(1_700_000_000));
        assert_eq!(chats[1].name, None);
        // Negative counts never drive the unread meter.
        assert_eq!(chats[2].unread_count, 0);
    }

    #[test]
    fn contacts_parse() {
        let contacts = parse_contacts(&contact_list());
        assert_eq!(contacts.len(), 2);
        assert_eq!(contacts[0].notify.as_deref(), Some("ada"));
        assert_eq!(contacts[1].jid, "15556789@s.whatsapp.net");
    }

    #[tokio::test]
    async fn handlers_deregister_once_the_load_completes() {
        let client = test_client();
        let driver = client.clone();
        let load = tokio::spawn(async move { driver.receive_chats_and_contacts().await });

        // Let the loader register its handlers before frames flow.
        tokio::time::sleep(Duration::from_millis(10)).await;

        client
            .dispatch("c1", json!(["response", {"type": "chat"}, []]))
            .await;
        client
            .dispatch("t1", json!(["response", {"type": "contacts"}, []]))
            .await;
        client
            .dispatch("a1", json!(["action", {"add": "last"}, [["message", {}, null]]]))
            .await;

        let (chats, contacts, unread) = load.await.unwrap().unwrap();
        assert!(chats.is_empty());
        assert!(contacts.is_empty());
        assert!(unread.is_empty());
        assert!(client.registry_is_empty().await);
    }
}
