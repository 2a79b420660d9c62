use anyhow::{Context, Result};
use env_logger::Env;
use lecture_relay::audio_input::AudioInput;
use lecture_relay::classroom::RecordingSession;
use lecture_relay::config::Config;
use lecture_relay::frame_queue::FrameQueue;
use lecture_relay::pipeline::PipelineRegistry;
use lecture_relay::presence::PresenceTracker;
use lecture_relay::recorder::SessionRecorder;
use lecture_relay::stt_socket::SttError;
use lecture_relay::translate::HttpTranslator;
use lecture_relay::tts::HttpSynthesizer;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> Result<()> {
    // ロガーを初期化
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    // コマンドライン引数をパース
    let args: Vec<String> = std::env::args().collect();

    // デバイス一覧表示モード
    if args.len() > 1 && args[1] == "--show-interfaces" {
        AudioInput::list_devices()?;
        return Ok(());
    }

    // 設定ファイル生成モード
    if args.len() > 1 && args[1] == "--generate-config" {
        let config_path = if args.len() > 2 {
            &args[2]
        } else {
            "config.toml"
        };
        Config::write_default(config_path)?;
        println!("設定ファイルを生成しました: {}", config_path);
        return Ok(());
    }

    // 教室ID（--classroom <id> で指定）
    let classroom_id = args
        .iter()
        .position(|a| a == "--classroom")
        .and_then(|i| args.get(i + 1))
        .cloned()
        .unwrap_or_else(|| "classroom-1".to_string());

    // 設定ファイルのパス
    let config_path = if args.len() > 1 && !args[1].starts_with("--") {
        &args[1]
    } else {
        "config.toml"
    };

    // 設定を読み込み
    let config = Config::load_or_default(config_path)?;

    log::info!("lecture-relay を起動します (教室: {})", classroom_id);
    log::info!("設定: {:?}", config);

    // Ctrl+C ハンドラを設定
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = running.clone();
    ctrlc::set_handler(move || {
        log::info!("停止シグナルを受信しました...");
        running_clone.store(false, Ordering::SeqCst);
    })?;

    // 翻訳・音声合成バックエンドとリスナーパイプライン
    let translator =
        Arc::new(HttpTranslator::new(config.translate.clone()).context("翻訳クライアントの初期化に失敗")?);
    let synthesizer =
        Arc::new(HttpSynthesizer::new(config.tts.clone()).context("TTSクライアントの初期化に失敗")?);
    let registry = Arc::new(PipelineRegistry::new(
        config.pipeline.clone(),
        translator,
        synthesizer,
    ));

    // プレゼンスとセッション記録
    let presence = PresenceTracker::new(&config.presence);
    let recorder = Arc::new(
        SessionRecorder::new(&config.recorder.output_dir)
            .context("セッションレコーダの初期化に失敗")?,
    );

    // 録音セッションを開始（STT接続を含む）
    let mut session = RecordingSession::start(
        &classroom_id,
        &config.stt,
        recorder,
        presence.clone(),
        Arc::clone(&registry),
    )
    .await?;

    // プレゼンスの定期掃除タスク
    let sweep_presence = presence.clone();
    let sweep_registry = Arc::clone(&registry);
    let sweep_interval = tokio::time::Duration::from_millis(config.presence.sweep_interval_ms);
    let sweep_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_interval);
        loop {
            interval.tick().await;
            for (classroom, listener) in sweep_presence.sweep() {
                log::info!("リスナー {} が猶予期間切れで退出 (教室: {})", listener, classroom);
                sweep_registry.remove(&classroom, &listener);
            }
        }
    });

    // 標準入力からプレゼンス信号（JSON行）を取り込むタスク
    // （教室チャンネルの信号を標準出力の配信行と対になる形で中継する想定）
    let intake_presence = presence.clone();
    let intake_classroom = classroom_id.clone();
    let intake_task = tokio::spawn(async move {
        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        let mut lines = stdin.lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            intake_presence.apply_signal_line(&intake_classroom, line);
        }
        log::info!("プレゼンス信号の入力が終了しました");
    });

    // AudioInputを作成して開始
    // チャンネルは受け渡し用の小さなバッファに留め、滞留は
    // FrameQueue がドロップポリシーに従って引き受ける
    let (frame_tx, mut frame_rx) = mpsc::channel(32);
    let mut audio_input = AudioInput::new(&config.audio)?;
    audio_input.start(frame_tx)?;

    let mut frame_queue = FrameQueue::new(&config.frame_queue, config.audio.sample_rate);

    log::info!("録音を開始しました (Ctrl+C で停止)");

    // メインループ: フレームをキュー経由でSTTへ送信
    while running.load(Ordering::SeqCst) {
        tokio::select! {
            Some(frame) = frame_rx.recv() => {
                frame_queue.push(frame);
                frame_queue.drain_from(&mut frame_rx);

                while let Some(queued) = frame_queue.pop() {
                    match session.send_frame(&queued.samples).await {
                        Ok(_) => {}
                        Err(SttError::Closed) => {
                            log::error!("STT接続が閉じられたため送信を停止します");
                            running.store(false, Ordering::SeqCst);
                            break;
                        }
                        Err(e) => {
                            log::warn!("フレーム送信エラー: {}", e);
                        }
                    }

                    // 送信待ちの間に到着したフレームもキューの管理下に置く
                    frame_queue.drain_from(&mut frame_rx);
                }
            }
            _ = tokio::time::sleep(tokio::time::Duration::from_millis(100)) => {
                // タイムアウト: ループを継続して running をチェック
            }
        }
    }

    // クリーンアップ
    log::info!("停止処理を開始します...");

    audio_input.stop();
    sweep_task.abort();
    intake_task.abort();

    if frame_queue.dropped_frames() > 0 {
        log::warn!(
            "バックプレッシャーにより {} フレームを破棄しました",
            frame_queue.dropped_frames()
        );
    }

    session.stop().await?;

    log::info!("lecture-relay を終了しました");

    Ok(())
}
