use crate::types::DropPolicy;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub frame_queue: FrameQueueConfig,
    #[serde(default)]
    pub stt: SttConfig,
    #[serde(default)]
    pub translate: TranslateConfig,
    #[serde(default)]
    pub tts: TtsConfig,
    #[serde(default)]
    pub presence: PresenceConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub recorder: RecorderConfig,
}

/// オーディオ入力設定
///
/// マイクからの入力に関する設定。STTプロトコルの要求により
/// モノラル・16kHz固定で扱う。
///
/// # デフォルト値
///
/// - `device_id`: "default" (システムのデフォルトデバイス)
/// - `sample_rate`: 16000 Hz
/// - `frame_samples`: 2048 サンプル (128ms分)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AudioConfig {
    #[serde(default = "default_device_id")]
    pub device_id: String,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_frame_samples")]
    pub frame_samples: usize,
}

/// フレームキュー設定
///
/// キャプチャとSTTコネクタの間の有界バッファに関する設定。
///
/// # デフォルト値
///
/// - `capacity_frames`: 256 フレーム
/// - `drop_policy`: DropOldest
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FrameQueueConfig {
    #[serde(default = "default_capacity_frames")]
    pub capacity_frames: usize,
    #[serde(default = "default_drop_policy")]
    pub drop_policy: DropPolicy,
}

/// STT (Speech-to-Text) 接続設定
///
/// # デフォルト値
///
/// - `endpoint`: "wss://localhost:8443"
/// - `language`: "en" ("mixed" を指定すると自動検出モード)
/// - `connect_timeout_seconds`: 10 秒
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SttConfig {
    #[serde(default = "default_stt_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_connect_timeout_seconds")]
    pub connect_timeout_seconds: u64,
}

/// 翻訳サービス設定
///
/// # デフォルト値
///
/// - `endpoint`: "https://localhost:8444/translate"
/// - `timeout_seconds`: 30 秒
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TranslateConfig {
    #[serde(default = "default_translate_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_http_timeout_seconds")]
    pub timeout_seconds: u64,
}

/// 音声合成 (TTS) サービス設定
///
/// # デフォルト値
///
/// - `endpoint`: "https://localhost:8445/tts"
/// - `timeout_seconds`: 30 秒
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TtsConfig {
    #[serde(default = "default_tts_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_http_timeout_seconds")]
    pub timeout_seconds: u64,
}

/// プレゼンス設定
///
/// ハートビートが途絶えてから退出とみなすまでの猶予期間。
///
/// # デフォルト値
///
/// - `grace_period_ms`: 30000 ms
/// - `sweep_interval_ms`: 5000 ms
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PresenceConfig {
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

/// リスナーパイプライン設定
///
/// # デフォルト値
///
/// - `debounce_ms`: 1000 ms（発話が安定するまでの待機時間）
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

/// セッション記録設定
///
/// # デフォルト値
///
/// - `output_dir`: "./sessions"
/// - `log_level`: "info"
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RecorderConfig {
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

// Default functions
fn default_device_id() -> String {
    "default".to_string()
}

fn default_sample_rate() -> u32 {
    16000 // 16kHz - STTプロトコルの要求値
}

fn default_frame_samples() -> usize {
    2048 // 128ms分 @ 16kHz
}

fn default_capacity_frames() -> usize {
    256 // 約32秒分
}

fn default_drop_policy() -> DropPolicy {
    DropPolicy::DropOldest
}

fn default_stt_endpoint() -> String {
    "wss://localhost:8443".to_string()
}

fn default_language() -> String {
    "en".to_string()
}

fn default_connect_timeout_seconds() -> u64 {
    10
}

fn default_translate_endpoint() -> String {
    "https://localhost:8444/translate".to_string()
}

fn default_tts_endpoint() -> String {
    "https://localhost:8445/tts".to_string()
}

fn default_http_timeout_seconds() -> u64 {
    30
}

fn default_grace_period_ms() -> u64 {
    30000
}

fn default_sweep_interval_ms() -> u64 {
    5000
}

fn default_debounce_ms() -> u64 {
    1000
}

fn default_output_dir() -> String {
    "./sessions".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            audio: AudioConfig::default(),
            frame_queue: FrameQueueConfig::default(),
            stt: SttConfig::default(),
            translate: TranslateConfig::default(),
            tts: TtsConfig::default(),
            presence: PresenceConfig::default(),
            pipeline: PipelineConfig::default(),
            recorder: RecorderConfig::default(),
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            device_id: default_device_id(),
            sample_rate: default_sample_rate(),
            frame_samples: default_frame_samples(),
        }
    }
}

impl Default for FrameQueueConfig {
    fn default() -> Self {
        Self {
            capacity_frames: default_capacity_frames(),
            drop_policy: default_drop_policy(),
        }
    }
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            endpoint: default_stt_endpoint(),
            language: default_language(),
            connect_timeout_seconds: default_connect_timeout_seconds(),
        }
    }
}

impl Default for TranslateConfig {
    fn default() -> Self {
        Self {
            endpoint: default_translate_endpoint(),
            api_key: None,
            timeout_seconds: default_http_timeout_seconds(),
        }
    }
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            endpoint: default_tts_endpoint(),
            timeout_seconds: default_http_timeout_seconds(),
        }
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: default_grace_period_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
        }
    }
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// 設定ファイルを読み込み
    ///
    /// # Arguments
    ///
    /// * `path` - 設定ファイル (TOML) のパス
    ///
    /// # Errors
    ///
    /// ファイルが存在しない、またはパースに失敗した場合にエラーを返す。
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("設定ファイルの読み込みに失敗: {:?}", path.as_ref()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("設定ファイルのパースに失敗: {:?}", path.as_ref()))?;
        Ok(config)
    }

    /// デフォルト設定をファイルに書き出し
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use lecture_relay::config::Config;
    /// Config::write_default("config.toml").unwrap();
    /// ```
    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<()> {
        let config = Config::default();
        let content =
            toml::to_string_pretty(&config).with_context(|| "設定のシリアライズに失敗")?;
        fs::write(path.as_ref(), content)
            .with_context(|| format!("設定ファイルの書き込みに失敗: {:?}", path.as_ref()))?;
        Ok(())
    }

    /// 設定ファイルがあれば読み込み、なければデフォルトを使用
    ///
    /// # Errors
    ///
    /// ファイルが存在するがパースに失敗した場合にエラーを返す。
    /// ファイルが存在しない場合はエラーにならず、デフォルト設定を返す。
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use lecture_relay::config::Config;
    /// let config = Config::load_or_default("config.toml").unwrap();
    /// ```
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::from_file(path)
        } else {
            log::warn!(
                "設定ファイルが見つかりません。デフォルト設定を使用します: {:?}",
                path.as_ref()
            );
            Ok(Config::default())
        }
    }
}
