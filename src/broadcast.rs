use crate::pipeline::PipelineRegistry;
use crate::presence::PresenceTracker;
use crate::types::TranscriptEvent;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// 教室チャンネルの `transcription` イベントのペイロード（ワイヤ形式）
///
/// TranscriptEvent 1件につき1回配信される。
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TranscriptionPayload {
    pub transcription: String,
}

impl TranscriptionPayload {
    pub fn from_event(event: &TranscriptEvent) -> Self {
        Self {
            transcription: event.text.clone(),
        }
    }
}

/// 文字起こしイベントのファンアウト
///
/// 配信先は publish 時点の PresenceTracker スナップショットのみで決まる。
/// 各リスナーへの配信は独立かつ非ブロッキングで、遅いパイプラインが
/// 他のリスナーや永続化を遅らせることはない。publish 後に参加した
/// リスナーが過去のイベントを受け取ることもない。
pub struct TranscriptBroadcaster {
    presence: PresenceTracker,
    registry: Arc<PipelineRegistry>,
}

impl TranscriptBroadcaster {
    pub fn new(presence: PresenceTracker, registry: Arc<PipelineRegistry>) -> Self {
        Self { presence, registry }
    }

    /// イベントを教室の全在席リスナーへ配信
    ///
    /// 配信はパイプラインのデバウンスタイマーを張るだけなので
    /// 呼び出し側をブロックしない。
    ///
    /// # Returns
    /// 配信したリスナー数
    pub fn publish(&self, classroom_id: &str, event: &TranscriptEvent) -> usize {
        let snapshot = self.presence.snapshot(classroom_id);
        let mut delivered = 0;

        for listener in snapshot.listeners {
            // join時に登録済みでなければここで生成する
            let pipeline = self.registry.register(classroom_id, listener);
            pipeline.on_transcript(&event.text, event.sequence);
            delivered += 1;
        }

        log::debug!(
            "教室 {} へ配信: seq={} ({} リスナー)",
            classroom_id,
            event.sequence,
            delivered
        );

        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PipelineConfig, PresenceConfig};
    use crate::translate::Translator;
    use crate::tts::Synthesizer;
    use crate::types::{Listener, Role};
    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::Utc;

    struct EchoTranslator;

    #[async_trait]
    impl Translator for EchoTranslator {
        async fn translate(&self, text: &str, _target_language: &str) -> Result<String> {
            Ok(text.to_string())
        }
    }

    struct NoopSynthesizer;

    #[async_trait]
    impl Synthesizer for NoopSynthesizer {
        async fn synthesize(&self, _text: &str, _language: &str) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
    }

    fn student(id: &str) -> Listener {
        Listener {
            listener_id: id.to_string(),
            target_language: "ja".to_string(),
            audio_enabled: false,
            role: Role::Student,
        }
    }

    fn event(sequence: u64, text: &str) -> TranscriptEvent {
        TranscriptEvent {
            session_id: "session-1".to_string(),
            sequence,
            text: text.to_string(),
            emitted_at: Utc::now(),
        }
    }

    fn setup() -> (PresenceTracker, Arc<PipelineRegistry>, TranscriptBroadcaster) {
        let presence = PresenceTracker::new(&PresenceConfig {
            grace_period_ms: 30000,
            sweep_interval_ms: 1000,
        });
        let registry = Arc::new(PipelineRegistry::new(
            PipelineConfig { debounce_ms: 1000 },
            Arc::new(EchoTranslator),
            Arc::new(NoopSynthesizer),
        ));
        let broadcaster = TranscriptBroadcaster::new(presence.clone(), Arc::clone(&registry));
        (presence, registry, broadcaster)
    }

    #[tokio::test]
    async fn test_fan_out_to_all_present_listeners() {
        let (presence, registry, broadcaster) = setup();

        presence.join("c-1", student("s1"), "生徒1");
        presence.join("c-1", student("s2"), "生徒2");
        presence.join("c-1", student("s3"), "生徒3");

        let delivered = broadcaster.publish("c-1", &event(1, "hello"));
        assert_eq!(delivered, 3);

        // 各リスナーのパイプラインにちょうど1回届いている
        for id in ["s1", "s2", "s3"] {
            let pipeline = registry.get("c-1", id).unwrap();
            assert_eq!(pipeline.source_text(), "hello");
        }

        // 配信後に参加したリスナーは過去のイベントを受け取らない
        presence.join("c-1", student("s4"), "生徒4");
        let pipeline = registry.register("c-1", student("s4"));
        assert_eq!(pipeline.source_text(), "");

        // 次のイベントには4人全員が含まれる
        let delivered = broadcaster.publish("c-1", &event(2, "world"));
        assert_eq!(delivered, 4);
        assert_eq!(registry.get("c-1", "s4").unwrap().source_text(), "world");
    }

    #[tokio::test]
    async fn test_publish_empty_classroom() {
        let (_presence, registry, broadcaster) = setup();

        let delivered = broadcaster.publish("c-empty", &event(1, "hello"));
        assert_eq!(delivered, 0);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_teacher_not_a_delivery_target() {
        let (presence, _registry, broadcaster) = setup();

        presence.join(
            "c-1",
            Listener {
                listener_id: "t-1".to_string(),
                target_language: "en".to_string(),
                audio_enabled: false,
                role: Role::Teacher,
            },
            "先生",
        );
        presence.join("c-1", student("s1"), "生徒1");

        // 教師自身は配信対象に含まれない
        let delivered = broadcaster.publish("c-1", &event(1, "hello"));
        assert_eq!(delivered, 1);
    }

    #[test]
    fn test_payload_wire_format() {
        let payload = TranscriptionPayload::from_event(&event(1, "こんにちは"));
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["transcription"], "こんにちは");
    }
}
