//! `/chat` namespace: logs membership and echoes events back.

use switchboard_session::{InboundEvent, NamespaceListener, SessionId, SessionManager};

pub const CHAT_NAMESPACE: &str = "/chat";

/// Echoes every event. Events that request an ack get their arguments back
/// as the ack; the rest are re-emitted to the sender under the same name.
pub struct ChatListener;

impl NamespaceListener for ChatListener {
    fn on_connect(&self, _manager: &SessionManager, sid: SessionId, namespace: &str) {
        crate::component_info!("chat", %sid, "session joined {}", namespace);
    }

    fn on_disconnect(&self, _manager: &SessionManager, sid: SessionId, namespace: &str) {
        crate::component_info!("chat", %sid, "session left {}", namespace);
    }

    fn on_event(&self, manager: &SessionManager, sid: SessionId, event: InboundEvent) {
        crate::component_debug!("chat", %sid, event = %event.name, args = event.args.len(), "event");

        let result = match event.ack_id {
            Some(ack_id) => manager.send_ack(sid, &event.namespace, ack_id, event.args),
            None => manager.emit(sid, &event.namespace, &event.name, event.args),
        };
        if let Err(e) = result {
            crate::component_warn!("chat", %sid, "echo failed: {}", e);
        }
    }
}
