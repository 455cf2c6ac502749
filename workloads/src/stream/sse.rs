/*
 * Copyright (c) Huawei Technologies Co., Ltd. 2024. All rights reserved.
 * KubeOS is licensed under the Mulan PSL v2.
 * You can use this software according to the terms and conditions of the Mulan PSL v2.
 * You may obtain a copy of Mulan PSL v2 at:
 *     http://license.coscl.org.cn/MulanPSL2
 * THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY KIND, EITHER EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO NON-INFRINGEMENT, MERCHANTABILITY OR FIT FOR A PARTICULAR
 * PURPOSE.
 * See the Mulan PSL v2 for more details.
 */

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

use super::{EventKind, StreamEvent};

lazy_static! {
    static ref ANSI_ESCAPE: Option<Regex> = Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b[@-Z\\-_]").ok();
}

pub fn strip_ansi(text: &str) -> String {
    match ANSI_ESCAPE.as_ref() {
        Some(re) => re.replace_all(text, "").into_owned(),
        None => text.to_string(),
    }
}

pub(super) fn strip_event_ansi(mut event: StreamEvent) -> StreamEvent {
    if let Some(Value::String(line)) = event.data.get_mut("line") {
        *line = strip_ansi(line);
    }
    event
}

/// Renders one server-sent event frame. Heartbeats are plain comments.
pub fn to_frame(event: &StreamEvent) -> String {
    if event.event == EventKind::Heartbeat {
        return ": heartbeat\n\n".to_string();
    }
    format!("id: {}\nevent: {}\ndata: {}\n\n", event.id, event.event, event.data)
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_frame() {
        let event = StreamEvent { id: 7, event: EventKind::StepStatus, data: json!({"name": "build-app"}) };
        assert_eq!(to_frame(&event), "id: 7\nevent: step-status\ndata: {\"name\":\"build-app\"}\n\n");
        assert_eq!(to_frame(&StreamEvent::heartbeat()), ": heartbeat\n\n");
    }

    #[test]
    fn test_strip_ansi() {
        assert_eq!(strip_ansi("\u{1b}[1;31merror\u{1b}[0m: boom"), "error: boom");
        assert_eq!(strip_ansi("plain"), "plain");
    }
}
