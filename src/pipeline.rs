use crate::config::PipelineConfig;
use crate::translate::Translator;
use crate::tts::Synthesizer;
use crate::types::{JobStatus, Listener, TranslationJob};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// リスナーごとの翻訳・音声合成パイプライン
///
/// 文字起こしの連続更新をデバウンスし、静止期間が経過した時点の
/// 最新テキストだけを翻訳する。世代カウンタにより、古いジョブの
/// 完了が新しい表示を上書きすることは決してない（追い越し保証）。
/// 各リスナーのパイプラインは完全に独立で、個別にキャンセルできる。
pub struct ListenerPipeline {
    listener: Listener,
    debounce: Duration,
    translator: Arc<dyn Translator>,
    synthesizer: Arc<dyn Synthesizer>,
    inner: Arc<Mutex<PipelineInner>>,
}

struct PipelineInner {
    /// 世代カウンタ。on_transcript のたびに増加し、stale検出に使う。
    generation: u64,
    source_text: String,
    source_sequence: u64,
    display_text: String,
    audio_cue: Option<Vec<u8>>,
    last_error: Option<String>,
    last_job: Option<TranslationJob>,
    cancelled: bool,
    timer: Option<tokio::task::JoinHandle<()>>,
}

impl ListenerPipeline {
    pub fn new(
        listener: Listener,
        config: &PipelineConfig,
        translator: Arc<dyn Translator>,
        synthesizer: Arc<dyn Synthesizer>,
    ) -> Self {
        Self {
            listener,
            debounce: Duration::from_millis(config.debounce_ms),
            translator,
            synthesizer,
            inner: Arc::new(Mutex::new(PipelineInner {
                generation: 0,
                source_text: String::new(),
                source_sequence: 0,
                display_text: String::new(),
                audio_cue: None,
                last_error: None,
                last_job: None,
                cancelled: false,
                timer: None,
            })),
        }
    }

    /// 文字起こしテキストを受信
    ///
    /// 世代を進め、デバウンスタイマーを張り直す。静止期間内の中間更新は
    /// キューに積まれず破棄される（最新のテキストだけが翻訳対象）。
    pub fn on_transcript(&self, text: &str, sequence: u64) {
        let old_timer;
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.cancelled {
                return;
            }

            inner.generation += 1;
            let generation = inner.generation;
            inner.source_text = text.to_string();
            inner.source_sequence = sequence;
            old_timer = inner.timer.take();

            // 未コミットの古いジョブは直ちに追い越される
            if let Some(job) = &mut inner.last_job {
                if matches!(job.status, JobStatus::Pending | JobStatus::Running) {
                    job.status = JobStatus::Superseded;
                }
            }

            inner.last_job = Some(TranslationJob {
                listener_id: self.listener.listener_id.clone(),
                source_text: text.to_string(),
                source_sequence: sequence,
                generation,
                status: JobStatus::Pending,
            });

            // 新タイマーの生成と保存は同一ロック区間で行う。
            // ロック外で保存すると、競合する2回の呼び出しが互いの
            // ハンドルを取り違え、古いタイマーのabortが漏れる。
            let task_inner = Arc::clone(&self.inner);
            let translator = Arc::clone(&self.translator);
            let synthesizer = Arc::clone(&self.synthesizer);
            let listener = self.listener.clone();
            let debounce = self.debounce;
            let text = text.to_string();

            inner.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(debounce).await;
                Self::run_job(task_inner, translator, synthesizer, listener, generation, text)
                    .await;
            }));
        }

        if let Some(timer) = old_timer {
            timer.abort();
        }
    }

    /// デバウンス満了後のジョブ実行: 翻訳 → (任意で) 音声合成
    async fn run_job(
        inner: Arc<Mutex<PipelineInner>>,
        translator: Arc<dyn Translator>,
        synthesizer: Arc<dyn Synthesizer>,
        listener: Listener,
        generation: u64,
        text: String,
    ) {
        // 実行直前にstale確認
        {
            let mut guard = inner.lock().unwrap();
            if guard.cancelled || guard.generation != generation {
                Self::set_job_status(&mut guard, generation, JobStatus::Superseded);
                return;
            }
            Self::set_job_status(&mut guard, generation, JobStatus::Running);
        }

        let translated = match translator
            .translate(&text, &listener.target_language)
            .await
        {
            Ok(translated) => translated,
            Err(e) => {
                log::warn!(
                    "リスナー {} の翻訳に失敗: {}",
                    listener.listener_id,
                    e
                );
                let mut guard = inner.lock().unwrap();
                if guard.generation == generation && !guard.cancelled {
                    guard.last_error = Some(format!("翻訳失敗: {}", e));
                    Self::set_job_status(&mut guard, generation, JobStatus::Failed);
                } else {
                    Self::set_job_status(&mut guard, generation, JobStatus::Superseded);
                }
                return;
            }
        };

        // コミット: 世代が進んでいたら結果を破棄（追い越し保証の核心）
        {
            let mut guard = inner.lock().unwrap();
            if guard.cancelled || guard.generation != generation {
                Self::set_job_status(&mut guard, generation, JobStatus::Superseded);
                return;
            }
            guard.display_text = translated.clone();
            Self::set_job_status(&mut guard, generation, JobStatus::Done);
        }

        if !listener.audio_enabled {
            return;
        }

        // 音声合成の失敗はパイプラインローカルで記録し、表示には影響しない
        match synthesizer
            .synthesize(&translated, &listener.target_language)
            .await
        {
            Ok(audio) => {
                let mut guard = inner.lock().unwrap();
                if guard.generation == generation && !guard.cancelled {
                    guard.audio_cue = Some(audio);
                }
            }
            Err(e) => {
                log::warn!(
                    "リスナー {} の音声合成に失敗: {}",
                    listener.listener_id,
                    e
                );
                let mut guard = inner.lock().unwrap();
                if guard.generation == generation && !guard.cancelled {
                    guard.last_error = Some(format!("音声合成失敗: {}", e));
                }
            }
        }
    }

    /// 指定世代のジョブにのみ状態を反映（古い世代のログ更新を防ぐ）
    fn set_job_status(inner: &mut PipelineInner, generation: u64, status: JobStatus) {
        if let Some(job) = &mut inner.last_job {
            if job.generation == generation {
                job.status = status;
            }
        }
    }

    /// パイプラインをキャンセル
    ///
    /// 世代を無効化し（実行中のジョブはすべて追い越し扱いになる）、
    /// 保留中のタイマーをクリアする。以降、表示・音声が更新されることはない。
    pub fn cancel(&self) {
        let timer = {
            let mut inner = self.inner.lock().unwrap();
            inner.cancelled = true;
            inner.generation += 1;
            if let Some(job) = &mut inner.last_job {
                if matches!(job.status, JobStatus::Pending | JobStatus::Running) {
                    job.status = JobStatus::Superseded;
                }
            }
            inner.timer.take()
        };

        if let Some(timer) = timer {
            timer.abort();
        }

        log::debug!(
            "リスナー {} のパイプラインをキャンセルしました",
            self.listener.listener_id
        );
    }

    /// 現在の表示テキスト（最後に確定した発話の翻訳）
    pub fn display_text(&self) -> String {
        self.inner.lock().unwrap().display_text.clone()
    }

    /// 最新の合成音声（TTS有効時のみ）
    pub fn audio_cue(&self) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().audio_cue.clone()
    }

    /// 最後に記録されたパイプラインローカルのエラー
    pub fn last_error(&self) -> Option<String> {
        self.inner.lock().unwrap().last_error.clone()
    }

    /// 最後に受信した原文テキスト
    pub fn source_text(&self) -> String {
        self.inner.lock().unwrap().source_text.clone()
    }

    /// 最新ジョブの状態
    pub fn last_job_status(&self) -> Option<JobStatus> {
        self.inner.lock().unwrap().last_job.as_ref().map(|j| j.status)
    }

    /// 対象リスナー
    pub fn listener(&self) -> &Listener {
        &self.listener
    }
}

/// (教室ID, リスナーID) をキーとするパイプラインのレジストリ
///
/// プレゼンス参加時に生成し、退出・セッション終了時に
/// キャンセルして破棄する。
pub struct PipelineRegistry {
    pipelines: Mutex<HashMap<(String, String), Arc<ListenerPipeline>>>,
    config: PipelineConfig,
    translator: Arc<dyn Translator>,
    synthesizer: Arc<dyn Synthesizer>,
}

impl PipelineRegistry {
    pub fn new(
        config: PipelineConfig,
        translator: Arc<dyn Translator>,
        synthesizer: Arc<dyn Synthesizer>,
    ) -> Self {
        Self {
            pipelines: Mutex::new(HashMap::new()),
            config,
            translator,
            synthesizer,
        }
    }

    /// リスナーのパイプラインを生成して登録
    ///
    /// 既存のパイプラインがあればそれを返す（参加の再通知は無視）。
    pub fn register(&self, classroom_id: &str, listener: Listener) -> Arc<ListenerPipeline> {
        let key = (classroom_id.to_string(), listener.listener_id.clone());
        let mut pipelines = self.pipelines.lock().unwrap();

        if let Some(existing) = pipelines.get(&key) {
            return Arc::clone(existing);
        }

        let pipeline = Arc::new(ListenerPipeline::new(
            listener,
            &self.config,
            Arc::clone(&self.translator),
            Arc::clone(&self.synthesizer),
        ));
        pipelines.insert(key, Arc::clone(&pipeline));
        pipeline
    }

    /// パイプラインを取得
    pub fn get(&self, classroom_id: &str, listener_id: &str) -> Option<Arc<ListenerPipeline>> {
        let key = (classroom_id.to_string(), listener_id.to_string());
        self.pipelines.lock().unwrap().get(&key).cloned()
    }

    /// リスナーの退出: キャンセルして破棄
    pub fn remove(&self, classroom_id: &str, listener_id: &str) {
        let key = (classroom_id.to_string(), listener_id.to_string());
        if let Some(pipeline) = self.pipelines.lock().unwrap().remove(&key) {
            pipeline.cancel();
        }
    }

    /// 教室の全パイプラインをキャンセルして破棄（セッション終了時）
    pub fn cancel_classroom(&self, classroom_id: &str) {
        let mut pipelines = self.pipelines.lock().unwrap();
        let keys: Vec<_> = pipelines
            .keys()
            .filter(|(c, _)| c == classroom_id)
            .cloned()
            .collect();

        for key in keys {
            if let Some(pipeline) = pipelines.remove(&key) {
                pipeline.cancel();
            }
        }

        log::info!("教室 {} の全パイプラインをキャンセルしました", classroom_id);
    }

    /// 登録中のパイプライン数
    pub fn len(&self) -> usize {
        self.pipelines.lock().unwrap().len()
    }

    /// レジストリが空かどうか
    pub fn is_empty(&self) -> bool {
        self.pipelines.lock().unwrap().is_empty()
    }
}
