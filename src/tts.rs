use crate::config::TtsConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;

/// 音声合成バックエンドの共通トレイト
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// テキストを音声（バイナリ）に合成
    async fn synthesize(&self, text: &str, language: &str) -> Result<Vec<u8>>;
}

/// 音声合成APIリクエスト
#[derive(Debug, Serialize)]
struct SynthesizeRequest<'a> {
    text: &'a str,
    language: &'a str,
}

/// HTTP音声合成サービスクライアント
///
/// `POST {text, language}` → バイナリ音声 (audio/mpeg) のプロトコルで
/// 合成する。非2xxレスポンスは失敗。
pub struct HttpSynthesizer {
    config: TtsConfig,
    client: reqwest::Client,
}

impl HttpSynthesizer {
    pub fn new(config: TtsConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_seconds))
            .build()
            .context("TTS HTTPクライアント作成失敗")?;

        Ok(Self { config, client })
    }
}

#[async_trait]
impl Synthesizer for HttpSynthesizer {
    async fn synthesize(&self, text: &str, language: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .post(&self.config.endpoint)
            .json(&SynthesizeRequest { text, language })
            .send()
            .await
            .context("TTSリクエスト送信失敗")?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("TTSリクエストがエラーを返しました: {}", status);
        }

        let bytes = response
            .bytes()
            .await
            .context("TTSレスポンスボディの受信に失敗")?;

        log::debug!("音声合成完了 ({}): {} バイト", language, bytes.len());

        Ok(bytes.to_vec())
    }
}
