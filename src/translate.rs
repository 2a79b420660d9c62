use crate::config::TranslateConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// 翻訳バックエンドの共通トレイト
///
/// ListenerPipeline はこのトレイト経由で翻訳を呼び出す。
#[async_trait]
pub trait Translator: Send + Sync {
    /// テキストを指定言語へ翻訳
    async fn translate(&self, text: &str, target_language: &str) -> Result<String>;
}

/// 翻訳APIリクエスト
#[derive(Debug, Serialize)]
struct TranslateRequest<'a> {
    q: &'a str,
    target: &'a str,
}

/// 翻訳APIレスポンス
#[derive(Debug, Deserialize)]
struct TranslateResponse {
    #[serde(rename = "translatedText")]
    translated_text: String,
}

/// HTTP翻訳サービスクライアント
///
/// `POST {q, target}` → `{translatedText}` のプロトコルで翻訳する。
/// 非2xxレスポンスまたは不正なボディは失敗。
pub struct HttpTranslator {
    config: TranslateConfig,
    client: reqwest::Client,
}

impl HttpTranslator {
    pub fn new(config: TranslateConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_seconds))
            .build()
            .context("翻訳HTTPクライアント作成失敗")?;

        Ok(Self { config, client })
    }
}

#[async_trait]
impl Translator for HttpTranslator {
    async fn translate(&self, text: &str, target_language: &str) -> Result<String> {
        let mut request = self.client.post(&self.config.endpoint).json(&TranslateRequest {
            q: text,
            target: target_language,
        });

        if let Some(api_key) = &self.config.api_key {
            request = request.query(&[("key", api_key.as_str())]);
        }

        let response = request.send().await.context("翻訳リクエスト送信失敗")?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("翻訳リクエストがエラーを返しました: {}", status);
        }

        let body: TranslateResponse = response
            .json()
            .await
            .context("翻訳レスポンスのパースに失敗")?;

        log::debug!(
            "翻訳完了 ({}): {} 文字 → {} 文字",
            target_language,
            text.chars().count(),
            body.translated_text.chars().count()
        );

        Ok(body.translated_text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        let request = TranslateRequest {
            q: "hello",
            target: "ja",
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["q"], "hello");
        assert_eq!(json["target"], "ja");
    }

    #[test]
    fn test_response_parsing() {
        let body: TranslateResponse =
            serde_json::from_str(r#"{"translatedText":"こんにちは"}"#).unwrap();
        assert_eq!(body.translated_text, "こんにちは");

        // 必須フィールド欠落はエラー
        assert!(serde_json::from_str::<TranslateResponse>(r#"{"text":"x"}"#).is_err());
    }

    #[test]
    fn test_client_creation() {
        let result = HttpTranslator::new(TranslateConfig::default());
        assert!(result.is_ok());
    }
}
