use crate::broadcast::{TranscriptBroadcaster, TranscriptionPayload};
use crate::config::SttConfig;
use crate::pipeline::PipelineRegistry;
use crate::presence::PresenceTracker;
use crate::recorder::{FinalizeOutcome, SessionRecorder};
use crate::stt_socket::{SttError, SttSocket};
use crate::types::{SampleI16, Session, TranscriptEvent};
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// 1教室の録音セッション
///
/// 開始時にセッションを作成してSTTサーバへ接続し、受信した
/// 文字起こしを永続化・配信するポンプタスクを起動する。
/// 停止時にSTT接続を閉じ、セッションを確定する。
pub struct RecordingSession {
    session: Session,
    stt: SttSocket,
    recorder: Arc<SessionRecorder>,
    presence: PresenceTracker,
    registry: Arc<PipelineRegistry>,
    pump_handle: Option<JoinHandle<()>>,
}

impl RecordingSession {
    /// 録音セッションを開始
    ///
    /// セッションの作成はSTT接続より先に行う。接続に失敗した場合は
    /// 作成済みのセッションを参加者0名で即座にfinalizeしてから
    /// エラーを返す。
    pub async fn start(
        classroom_id: &str,
        stt_config: &SttConfig,
        recorder: Arc<SessionRecorder>,
        presence: PresenceTracker,
        registry: Arc<PipelineRegistry>,
    ) -> Result<Self> {
        let session = recorder.start(classroom_id)?;
        log::info!(
            "録音セッション開始: {} (教室: {})",
            session.id,
            classroom_id
        );

        let (stt, events) = match SttSocket::connect(stt_config, &session.id).await {
            Ok(pair) => pair,
            Err(e) => {
                log::error!("STT接続に失敗したためセッションを終了します: {}", e);
                if let Err(fin_err) = recorder.finalize(&session.id, 0) {
                    log::error!("セッションのfinalizeに失敗: {:#}", fin_err);
                }
                return Err(e.into());
            }
        };

        let broadcaster = TranscriptBroadcaster::new(presence.clone(), Arc::clone(&registry));
        let pump_handle = tokio::spawn(Self::pump(
            events,
            Arc::clone(&recorder),
            broadcaster,
            classroom_id.to_string(),
        ));

        Ok(Self {
            session,
            stt,
            recorder,
            presence,
            registry,
            pump_handle: Some(pump_handle),
        })
    }

    /// 文字起こしイベントの受信ポンプ
    ///
    /// 永続化の失敗は記録するのみで、ライブ配信は継続する。
    async fn pump(
        mut events: mpsc::Receiver<TranscriptEvent>,
        recorder: Arc<SessionRecorder>,
        broadcaster: TranscriptBroadcaster,
        classroom_id: String,
    ) {
        while let Some(event) = events.recv().await {
            if let Err(e) = recorder.append(&event.session_id, &event) {
                log::error!("文字起こしの永続化に失敗（配信は継続）: {:#}", e);
            }

            let delivered = broadcaster.publish(&classroom_id, &event);
            log::debug!(
                "文字起こし seq={} を {} 名のリスナーへ配信",
                event.sequence,
                delivered
            );

            // 正準（教師言語）の文字起こしを標準出力にも流す
            match serde_json::to_string(&TranscriptionPayload::from_event(&event)) {
                Ok(line) => println!("{}", line),
                Err(e) => log::error!("配信ペイロードのシリアライズに失敗: {}", e),
            }
        }

        log::info!("文字起こしポンプを終了しました (教室: {})", classroom_id);
    }

    /// 音声フレームをSTTサーバへ送信
    pub async fn send_frame(&mut self, samples: &[SampleI16]) -> Result<(), SttError> {
        self.stt.send_frame(samples).await
    }

    /// セッション情報を取得
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// 録音セッションを停止（冪等）
    ///
    /// STT接続を閉じてポンプの残イベントを流しきった後、
    /// その時点のプレゼンス人数でセッションを確定する。
    /// 確定後に教室の全パイプラインをキャンセルする。
    pub async fn stop(&mut self) -> Result<Option<Session>> {
        self.stt.close().await;

        if let Some(handle) = self.pump_handle.take() {
            if let Err(e) = handle.await {
                log::warn!("ポンプタスクの終了待ちに失敗: {}", e);
            }
        }

        let participant_count = self
            .presence
            .snapshot(&self.session.classroom_id)
            .listeners
            .len();

        let outcome = self.recorder.finalize(&self.session.id, participant_count)?;
        self.registry.cancel_classroom(&self.session.classroom_id);

        match outcome {
            FinalizeOutcome::Finalized(session) => {
                log::info!(
                    "録音セッション終了: {} ({} 分, 参加者 {} 名)",
                    session.id,
                    session.duration_minutes.unwrap_or(0),
                    participant_count
                );
                self.session = session.clone();
                Ok(Some(session))
            }
            FinalizeOutcome::AlreadyFinalized => Ok(None),
        }
    }
}
