use crate::config::AudioConfig;
use crate::types::AudioFrame;
use anyhow::{Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Sample, SizedSample};
use regex_lite::Regex;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

/// オーディオデバイスからのモノラル音声入力
///
/// デバイスがマルチチャンネルの場合は全チャンネルを平均して
/// モノラルにダウンミックスする。
pub struct AudioInput {
    device: cpal::Device,
    config: cpal::StreamConfig,
    stream: Option<cpal::Stream>,
    device_channels: u16,
}

impl AudioInput {
    /// 新しいAudioInputを作成
    pub fn new(config: &AudioConfig) -> Result<Self> {
        let host = cpal::default_host();

        log::info!("設定: {:?}", config);

        // デバイスを取得
        let device = if config.device_id == "default" {
            host.default_input_device()
                .context("デフォルト入力デバイスが見つかりません")?
        } else {
            // デバイスIDが指定されている場合は、デバイス一覧から検索
            Self::input_devices()?
                .into_iter()
                .find(|d| d.name().ok().as_deref() == Some(&config.device_id))
                .with_context(|| format!("デバイスが見つかりません: {}", config.device_id))?
        };

        log::info!("入力デバイス: {:?}", device.name());

        // デバイスの設定を取得
        let default_config = device
            .default_input_config()
            .context("デフォルト入力設定が取得できません")?;

        log::info!(
            "デバイス設定: {:?}, {}Hz, {}ch",
            default_config.sample_format(),
            default_config.sample_rate().0,
            default_config.channels()
        );

        let device_channels = default_config.channels();

        // ストリーム設定を作成
        let stream_config = cpal::StreamConfig {
            channels: device_channels,
            sample_rate: cpal::SampleRate(config.sample_rate),
            buffer_size: cpal::BufferSize::Fixed(
                config.frame_samples as u32 * device_channels as u32,
            ),
        };

        Ok(Self {
            device,
            config: stream_config,
            stream: None,
            device_channels,
        })
    }

    /// ストリームを開始
    ///
    /// キャプチャしたフレームは `frame_sender` へ非ブロッキングで送信される。
    pub fn start(&mut self, frame_sender: mpsc::Sender<AudioFrame>) -> Result<()> {
        let default_config = self.device.default_input_config()?;

        let stream = match default_config.sample_format() {
            cpal::SampleFormat::F32 => self.build_stream::<f32>(frame_sender)?,
            cpal::SampleFormat::I16 => self.build_stream::<i16>(frame_sender)?,
            cpal::SampleFormat::U16 => self.build_stream::<u16>(frame_sender)?,
            cpal::SampleFormat::I32 => self.build_stream::<i32>(frame_sender)?,
            _ => anyhow::bail!("サポートされていないサンプルフォーマット"),
        };

        stream.play().context("ストリームの再生開始に失敗")?;
        self.stream = Some(stream);

        log::info!("音声入力ストリームを開始しました");

        Ok(())
    }

    /// ストリームを構築
    fn build_stream<T>(&self, frame_sender: mpsc::Sender<AudioFrame>) -> Result<cpal::Stream>
    where
        T: SizedSample + Sample + Send + 'static,
        <T as Sample>::Float: Into<f32>,
    {
        let num_channels = self.device_channels as usize;

        let data_callback = move |data: &[T], _info: &cpal::InputCallbackInfo| {
            let timestamp_ns = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos();

            // インターリーブされたデータをモノラルにダウンミックス
            let samples_per_frame = data.len() / num_channels;
            let mut samples = Vec::with_capacity(samples_per_frame);
            for frame in 0..samples_per_frame {
                let mut acc = 0.0f32;
                for ch in 0..num_channels {
                    let sample = data[frame * num_channels + ch];
                    let f: f32 = sample.to_float_sample().into();
                    acc += f;
                }
                let mixed = (acc / num_channels as f32).clamp(-1.0, 1.0);
                samples.push((mixed * i16::MAX as f32) as i16);
            }

            let frame = AudioFrame {
                samples,
                timestamp_ns,
            };

            // 非同期送信（ブロッキングしない）
            match frame_sender.try_send(frame) {
                Ok(_) => {
                    // 成功時はログ出力しない（パフォーマンス重視）
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    log::warn!("フレーム送信失敗: バッファ満杯");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    log::warn!("フレーム送信失敗: チャンネルクローズ");
                }
            }
        };

        let error_callback = move |err| {
            log::error!("ストリームエラー: {}", err);
        };

        let stream = self
            .device
            .build_input_stream(&self.config, data_callback, error_callback, None)
            .context("入力ストリームの構築に失敗")?;

        Ok(stream)
    }

    /// ストリームを停止
    pub fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            log::info!("音声入力ストリームを停止しました");
        }
    }

    /// デバイス一覧を表示
    pub fn list_devices() -> Result<()> {
        println!("利用可能な入力デバイス:");
        println!();

        for (idx, device) in Self::input_devices()?.into_iter().enumerate() {
            let name = device.name()?;
            println!("  [{}] {}", idx, name);

            device.supported_input_configs()?.for_each(|config_range| {
                println!(
                    "      フォーマット: {:?}, {}-{}Hz, {}ch",
                    config_range.sample_format(),
                    config_range.min_sample_rate().0,
                    config_range.max_sample_rate().0,
                    config_range.channels()
                );
            });
            println!();
        }

        Ok(())
    }

    /// MacBook Air 本体・WebCam など、通常入力デバイスとして利用してはいけないデバイスを除外したデバイス一覧を取得
    fn input_devices() -> Result<Vec<cpal::Device>> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()?
            .filter(|device| {
                if let Ok(name) = device.name() {
                    // 除外するデバイス名のリスト
                    let excluded_names_regex = Regex::new("MacBook (Air|Pro)|AirPods|iPhone|Webcam|Background|Microsoft Teams|ZoomAudioDevice").unwrap();
                    if excluded_names_regex.is_match(&name) {
                        return false;
                    }
                    return true;
                } else {
                    true
                }
            })
            .collect();
        Ok(devices)
    }
}

impl Drop for AudioInput {
    fn drop(&mut self) {
        self.stop();
    }
}
