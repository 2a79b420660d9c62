//! lecture-relay - 教室向けライブ文字起こし・翻訳リレーシステム
//!
//! このクレートは、教師のマイク音声をキャプチャしてストリーミングSTTサーバへ
//! 中継し、得られた文字起こしを教室内の各リスナーへファンアウトする
//! システムを提供します。各リスナーは独立した翻訳・音声合成パイプラインを
//! 持ち、セッションの文字起こしは正準形（教師の言語）で永続化されます。
//!
//! # 主な機能
//!
//! - **モノラル音声入力**: マイクから16kHz PCM16の音声をキャプチャ
//! - **ストリーミングSTT**: WebSocket経由でリアルタイム文字起こし（自動言語検出対応）
//! - **リスナー別パイプライン**: デバウンスと世代管理による翻訳・TTSの追従
//! - **プレゼンス管理**: ハートビートと猶予期間付きの教室名簿
//! - **セッション記録**: JSON Linesの文字起こしログとセッションメタデータ
//!
//! # アーキテクチャ
//!
//! ```text
//! [Microphone] → [AudioInput] → [FrameQueue] → [SttSocket]
//!                                                   ↓
//!                                           [TranscriptEvent]
//!                                                   ↓
//!                              ┌────────────────────┼──────────────┐
//!                              │                    │              │
//!                      [SessionRecorder]   [TranscriptBroadcaster] │
//!                              │                    │              ↓
//!                              ↓                    ↓          [stdout]
//!                        [JSONL + meta]   [ListenerPipeline (×N)]
//!                                                   │
//!                                           [Translate] → [TTS]
//! ```
//!
//! # 使用例
//!
//! ```no_run
//! use lecture_relay::config::Config;
//!
//! // 設定ファイルを読み込み
//! let config = Config::load_or_default("config.toml").unwrap();
//!
//! // またはデフォルト設定を生成
//! Config::write_default("config.toml").unwrap();
//! ```

pub mod audio_input;
pub mod broadcast;
pub mod classroom;
pub mod config;
pub mod frame_queue;
pub mod pipeline;
pub mod presence;
pub mod recorder;
pub mod stt_socket;
pub mod translate;
pub mod tts;
pub mod types;
