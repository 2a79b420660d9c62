use crate::config::SttConfig;
use crate::types::{SampleI16, TranscriptEvent};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsWriteHalf =
    futures_util::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsReadHalf = futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// STTコネクタの状態
///
/// `Disconnected → Connecting → AwaitingReady → Streaming → Closing → Closed`
/// の順に遷移する。`ready` 受信前の音声送信は許可されない。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SttState {
    Disconnected,
    Connecting,
    AwaitingReady,
    Streaming,
    Closing,
    Closed,
}

/// STTコネクタのエラー
///
/// `ConnectTimeout` / `ConnectFailure` は録音開始に対して致命的で、
/// 自動リトライは行わない。
#[derive(Debug)]
pub enum SttError {
    /// 接続タイムアウト（既定10秒以内に ready に到達しなかった）
    ConnectTimeout,
    /// 接続失敗（トランスポート確立または ready 前の切断）
    ConnectFailure(String),
    /// ready 受信前に音声フレームを送信しようとした
    NotReady,
    /// クローズ済みの接続への送信
    Closed,
    /// 送信失敗
    Send(String),
}

impl fmt::Display for SttError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SttError::ConnectTimeout => write!(f, "STT接続がタイムアウトしました"),
            SttError::ConnectFailure(msg) => write!(f, "STT接続に失敗しました: {}", msg),
            SttError::NotReady => write!(f, "ready受信前に音声フレームは送信できません"),
            SttError::Closed => write!(f, "STT接続はクローズ済みです"),
            SttError::Send(msg) => write!(f, "STTへの送信に失敗しました: {}", msg),
        }
    }
}

impl std::error::Error for SttError {}

/// 教師が選択する言語モード
///
/// "mixed" は自動検出モードを意味し、明示的な言語コードとは排他。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LanguageMode {
    /// 明示的な言語コード（例: "en", "ja"）
    Explicit(String),
    /// 自動検出（言語コードは送らない）
    AutoDetect,
}

impl LanguageMode {
    /// 設定文字列から言語モードを決定
    pub fn from_setting(language: &str) -> Self {
        if language == "mixed" {
            LanguageMode::AutoDetect
        } else {
            LanguageMode::Explicit(language.to_string())
        }
    }

    fn config_message(&self) -> ConfigMessage {
        match self {
            LanguageMode::Explicit(code) => ConfigMessage {
                kind: "config",
                language: Some(code.clone()),
                enable_auto_detection: false,
            },
            LanguageMode::AutoDetect => ConfigMessage {
                kind: "config",
                language: None,
                enable_auto_detection: true,
            },
        }
    }
}

/// クライアント→サーバの設定メッセージ
///
/// 接続直後、音声送信前に一度だけ送る。
#[derive(Debug, Serialize)]
struct ConfigMessage {
    #[serde(rename = "type")]
    kind: &'static str,
    language: Option<String>,
    #[serde(rename = "enableAutoDetection")]
    enable_auto_detection: bool,
}

/// サーバ→クライアントのメッセージ
///
/// 既知の種別のみ厳密にパースし、未知の種別は `Unknown` に落とす。
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// ストリーミング準備完了。これを受けてから音声を送る。
    Ready,
    /// 認識された発話1件
    Transcript { transcript: String },
    /// 未知のメッセージ種別（無視する）
    #[serde(other)]
    Unknown,
}

/// STT (Speech-to-Text) ストリーミングコネクタ
///
/// 録音セッションごとに1本のWebSocket接続を所有する。
/// 音声フレームを送信し、確定テキストを `TranscriptEvent` として
/// セッション内シーケンス番号付きで受信チャンネルに流す。
pub struct SttSocket {
    write: WsWriteHalf,
    state: SttState,
    reader_handle: tokio::task::JoinHandle<()>,
}

impl SttSocket {
    /// STTサーバへ接続し、設定送信と ready 受信まで完了させる
    ///
    /// ハンドシェイク全体（トランスポート確立 → config送信 → ready受信）が
    /// `connect_timeout_seconds` 以内に完了しない場合は `ConnectTimeout` を
    /// 返す。失敗時の自動リトライは行わない。
    ///
    /// # Returns
    /// (コネクタ, TranscriptEvent受信チャンネル) のタプル
    pub async fn connect(
        config: &SttConfig,
        session_id: &str,
    ) -> Result<(Self, mpsc::Receiver<TranscriptEvent>), SttError> {
        let mode = LanguageMode::from_setting(&config.language);
        log::info!(
            "STTサーバへ接続します: {} (言語モード: {:?})",
            config.endpoint,
            mode
        );

        let connect_timeout = Duration::from_secs(config.connect_timeout_seconds);
        let handshake = Self::handshake(&config.endpoint, &mode);

        let (write, read) = match timeout(connect_timeout, handshake).await {
            Ok(result) => result?,
            Err(_) => {
                log::error!(
                    "STT接続タイムアウト: {}秒以内に ready を受信できませんでした",
                    config.connect_timeout_seconds
                );
                return Err(SttError::ConnectTimeout);
            }
        };

        log::info!("STTストリーム準備完了 (session_id: {})", session_id);

        let (event_tx, event_rx) = mpsc::channel::<TranscriptEvent>(32);
        let reader_handle = tokio::spawn(Self::read_transcripts(
            read,
            event_tx,
            session_id.to_string(),
        ));

        Ok((
            Self {
                write,
                state: SttState::Streaming,
                reader_handle,
            },
            event_rx,
        ))
    }

    /// トランスポート確立から ready 受信までのハンドシェイク
    async fn handshake(
        endpoint: &str,
        mode: &LanguageMode,
    ) -> Result<(WsWriteHalf, WsReadHalf), SttError> {
        // Connecting
        let (ws, _) = connect_async(endpoint)
            .await
            .map_err(|e| SttError::ConnectFailure(e.to_string()))?;
        let (mut write, mut read) = ws.split();

        // 接続直後、音声送信前に設定メッセージを一度だけ送る
        let config_json = serde_json::to_string(&mode.config_message())
            .map_err(|e| SttError::ConnectFailure(e.to_string()))?;
        write
            .send(Message::Text(config_json))
            .await
            .map_err(|e| SttError::ConnectFailure(e.to_string()))?;

        // AwaitingReady: ready を受信するまで待機
        loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerMessage>(&text)
                {
                    Ok(ServerMessage::Ready) => return Ok((write, read)),
                    Ok(other) => {
                        log::debug!("ready待機中に受信したメッセージを無視: {:?}", other);
                    }
                    Err(e) => {
                        // 単一の不正メッセージは破棄してストリームを継続
                        log::warn!("STTメッセージのパースに失敗（破棄）: {}", e);
                    }
                },
                Some(Ok(Message::Close(_))) | None => {
                    return Err(SttError::ConnectFailure(
                        "ready受信前に接続がクローズされました".to_string(),
                    ));
                }
                Some(Ok(_)) => {
                    // Ping/Pong などの制御フレームは無視
                }
                Some(Err(e)) => return Err(SttError::ConnectFailure(e.to_string())),
            }
        }
    }

    /// 受信ループ: transcript メッセージを TranscriptEvent に変換
    ///
    /// シーケンス番号はセッション内で単調増加（1始まり）。
    async fn read_transcripts(
        mut read: WsReadHalf,
        event_tx: mpsc::Sender<TranscriptEvent>,
        session_id: String,
    ) {
        let mut sequence: u64 = 0;

        while let Some(msg) = read.next().await {
            match msg {
                Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(ServerMessage::Transcript { transcript }) => {
                        if transcript.trim().is_empty() {
                            continue;
                        }
                        sequence += 1;
                        let event = TranscriptEvent {
                            session_id: session_id.clone(),
                            sequence,
                            text: transcript,
                            emitted_at: Utc::now(),
                        };
                        if event_tx.send(event).await.is_err() {
                            log::debug!("TranscriptEvent受信側が破棄されたため受信ループを終了");
                            break;
                        }
                    }
                    Ok(ServerMessage::Ready) => {
                        log::debug!("ストリーミング中に重複した ready を受信（無視）");
                    }
                    Ok(ServerMessage::Unknown) => {
                        log::debug!("未知のSTTメッセージ種別（無視）: {}", text);
                    }
                    Err(e) => {
                        // 単一の不正メッセージは破棄してストリームを継続
                        log::warn!("STTメッセージのパースに失敗（破棄）: {}", e);
                    }
                },
                Ok(Message::Close(frame)) => {
                    log::info!("STTサーバが接続をクローズしました: {:?}", frame);
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    log::error!("STT受信エラー: {}", e);
                    break;
                }
            }
        }

        log::info!("STT受信ループを終了しました (最終シーケンス: {})", sequence);
    }

    /// 音声フレームを送信
    ///
    /// PCM16リトルエンディアンのバイナリフレームとして送る。
    /// ready 受信前・クローズ後の送信はエラー。
    pub async fn send_frame(&mut self, samples: &[SampleI16]) -> Result<(), SttError> {
        match self.state {
            SttState::Streaming => {}
            SttState::Closing | SttState::Closed => return Err(SttError::Closed),
            _ => return Err(SttError::NotReady),
        }

        let bytes: Vec<u8> = samples.iter().flat_map(|&s| s.to_le_bytes()).collect();
        self.write
            .send(Message::Binary(bytes))
            .await
            .map_err(|e| SttError::Send(e.to_string()))
    }

    /// 接続をクローズ（冪等）
    ///
    /// 現在の状態に関わらず必ず `Closed` に遷移し、トランスポートを解放する。
    pub async fn close(&mut self) {
        if self.state == SttState::Closed {
            return;
        }
        self.state = SttState::Closing;

        if let Err(e) = self.write.send(Message::Close(None)).await {
            log::debug!("クローズフレーム送信に失敗（無視）: {}", e);
        }
        if let Err(e) = self.write.close().await {
            log::debug!("トランスポートのクローズに失敗（無視）: {}", e);
        }

        self.state = SttState::Closed;
        log::info!("STT接続をクローズしました");
    }

    /// 現在の状態を取得
    pub fn state(&self) -> SttState {
        self.state
    }
}

impl Drop for SttSocket {
    fn drop(&mut self) {
        self.reader_handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_config_message_auto_detect() {
        let mode = LanguageMode::from_setting("mixed");
        assert_eq!(mode, LanguageMode::AutoDetect);

        let json = serde_json::to_value(mode.config_message()).unwrap();
        assert_eq!(json["type"], "config");
        assert_eq!(json["language"], serde_json::Value::Null);
        assert_eq!(json["enableAutoDetection"], true);
    }

    #[test]
    fn test_config_message_explicit_language() {
        let mode = LanguageMode::from_setting("ja");
        let json = serde_json::to_value(mode.config_message()).unwrap();
        assert_eq!(json["type"], "config");
        assert_eq!(json["language"], "ja");
        assert_eq!(json["enableAutoDetection"], false);
    }

    #[test]
    fn test_server_message_parsing() {
        let ready: ServerMessage = serde_json::from_str(r#"{"type":"ready"}"#).unwrap();
        assert_eq!(ready, ServerMessage::Ready);

        let transcript: ServerMessage =
            serde_json::from_str(r#"{"type":"transcript","transcript":"hello"}"#).unwrap();
        assert_eq!(
            transcript,
            ServerMessage::Transcript {
                transcript: "hello".to_string()
            }
        );

        // 未知の種別は Unknown に落ちる
        let unknown: ServerMessage =
            serde_json::from_str(r#"{"type":"metrics","value":1}"#).unwrap();
        assert_eq!(unknown, ServerMessage::Unknown);

        // JSONとして不正なものはエラー
        assert!(serde_json::from_str::<ServerMessage>("not json").is_err());
    }

    /// テスト用STTサーバ: config受信 → ready送信 → 指定メッセージを順に送信
    async fn spawn_stt_server(messages: Vec<String>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

            // 最初のメッセージは設定メッセージのはず
            let first = ws.next().await.unwrap().unwrap();
            let config: serde_json::Value =
                serde_json::from_str(first.to_text().unwrap()).unwrap();
            assert_eq!(config["type"], "config");

            ws.send(Message::Text(r#"{"type":"ready"}"#.to_string()))
                .await
                .unwrap();

            for msg in messages {
                ws.send(Message::Text(msg)).await.unwrap();
            }

            // クライアント側がクローズするまで受信を続ける（音声フレームは読み捨て）
            while let Some(Ok(msg)) = ws.next().await {
                if matches!(msg, Message::Close(_)) {
                    break;
                }
            }
        });

        format!("ws://{}", addr)
    }

    fn test_config(endpoint: String, timeout_secs: u64) -> SttConfig {
        SttConfig {
            endpoint,
            language: "en".to_string(),
            connect_timeout_seconds: timeout_secs,
        }
    }

    #[tokio::test]
    async fn test_handshake_and_transcript_sequencing() {
        let endpoint = spawn_stt_server(vec![
            r#"{"type":"transcript","transcript":"hello"}"#.to_string(),
            "malformed {{{".to_string(),
            r#"{"type":"metrics","value":1}"#.to_string(),
            r#"{"type":"transcript","transcript":"hello world"}"#.to_string(),
        ])
        .await;

        let (mut socket, mut events) = SttSocket::connect(&test_config(endpoint, 10), "s-1")
            .await
            .unwrap();
        assert_eq!(socket.state(), SttState::Streaming);

        // ready 後は音声フレームを送信できる
        socket.send_frame(&[0i16; 2048]).await.unwrap();

        // 不正メッセージ・未知メッセージは破棄され、transcript のみが
        // 連番付きで届く
        let first = events.recv().await.unwrap();
        assert_eq!(first.session_id, "s-1");
        assert_eq!(first.sequence, 1);
        assert_eq!(first.text, "hello");

        let second = events.recv().await.unwrap();
        assert_eq!(second.sequence, 2);
        assert_eq!(second.text, "hello world");

        socket.close().await;
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        // TCPは受け付けるがWebSocketハンドシェイクに応答しないサーバ
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let result = SttSocket::connect(&test_config(format!("ws://{}", addr), 1), "s-1").await;
        match result {
            Err(SttError::ConnectTimeout) => {}
            other => panic!("ConnectTimeout を期待: {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_connect_failure_when_closed_before_ready() {
        // config を読んだ直後に ready を送らずクローズするサーバ
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let _ = ws.next().await;
            let _ = ws.close(None).await;
        });

        let result = SttSocket::connect(&test_config(format!("ws://{}", addr), 5), "s-1").await;
        assert!(matches!(result, Err(SttError::ConnectFailure(_))));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let endpoint = spawn_stt_server(vec![]).await;
        let (mut socket, _events) = SttSocket::connect(&test_config(endpoint, 10), "s-1")
            .await
            .unwrap();

        socket.close().await;
        assert_eq!(socket.state(), SttState::Closed);

        // 2回目のクローズも安全
        socket.close().await;
        assert_eq!(socket.state(), SttState::Closed);

        // クローズ後の送信はエラー
        assert!(matches!(
            socket.send_frame(&[0i16; 16]).await,
            Err(SttError::Closed)
        ));
    }
}
