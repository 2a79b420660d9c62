use crate::types::{Session, TranscriptEvent};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// finalize の結果
#[derive(Debug)]
pub enum FinalizeOutcome {
    /// 今回の呼び出しで確定した
    Finalized(Session),
    /// すでに確定済み（二重停止の冪等ガード）
    AlreadyFinalized,
}

/// 永続化される文字起こし行（ワイヤ形式）
#[derive(Debug, Serialize, Deserialize)]
pub struct TranscriptRow {
    pub session_id: String,
    pub sequence: u64,
    pub transcription: String,
    pub created_at: DateTime<Utc>,
}

/// 永続化されるセッション行（ワイヤ形式）
///
/// `student_count` と `duration_minutes` は finalize 時に一度だけ書き込まれる。
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionRow {
    pub id: String,
    pub classroom_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub student_count: Option<usize>,
    pub duration_minutes: Option<i64>,
}

/// 録音時間（分、切り捨て）を計算
///
/// floor((ended_at - started_at) / 60000ms)
pub fn duration_minutes(started_at: DateTime<Utc>, ended_at: DateTime<Utc>) -> i64 {
    (ended_at - started_at).num_milliseconds() / 60_000
}

struct SessionState {
    session: Session,
    writer: BufWriter<fs::File>,
    last_sequence: u64,
    rows_written: u64,
}

/// セッションごとの正準（教師言語）文字起こしの永続化
///
/// セッションごとに JSON Lines のログファイルと、finalize 時の
/// メタデータファイルを出力ディレクトリに書き出す。
/// 書き込み失敗は呼び出し側に報告されるが、ライブストリームを
/// 中断してはならない（呼び出し側はログに記録して継続する）。
pub struct SessionRecorder {
    output_dir: PathBuf,
    sessions: Mutex<HashMap<String, SessionState>>,
}

impl SessionRecorder {
    pub fn new<P: AsRef<Path>>(output_dir: P) -> Result<Self> {
        let output_dir = output_dir.as_ref().to_path_buf();

        // 出力ディレクトリが存在しない場合は作成
        if !output_dir.exists() {
            fs::create_dir_all(&output_dir)
                .with_context(|| format!("出力ディレクトリの作成に失敗: {:?}", output_dir))?;
        }

        Ok(Self {
            output_dir,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    /// 録音セッションを開始
    ///
    /// `started_at = now`, `ended_at = None` の Session を生成し、
    /// 文字起こしログファイルを作成する。
    pub fn start(&self, classroom_id: &str) -> Result<Session> {
        let session = Session {
            id: uuid::Uuid::new_v4().to_string(),
            classroom_id: classroom_id.to_string(),
            started_at: Utc::now(),
            ended_at: None,
            participant_count: None,
            duration_minutes: None,
        };

        let log_path = self.transcript_log_path(&session.id);
        log::info!("文字起こしログ作成: {:?}", log_path);

        let file = fs::File::create(&log_path)
            .with_context(|| format!("文字起こしログの作成に失敗: {:?}", log_path))?;

        let mut sessions = self.sessions.lock().unwrap();
        sessions.insert(
            session.id.clone(),
            SessionState {
                session: session.clone(),
                writer: BufWriter::new(file),
                last_sequence: 0,
                rows_written: 0,
            },
        );

        Ok(session)
    }

    /// 文字起こしイベントを永続化
    ///
    /// シーケンス順を保って追記する。読み手は欠番を許容するが
    /// 並び替えは許容しないため、順序が逆転するイベントは警告して
    /// 書き込まない。
    pub fn append(&self, session_id: &str, event: &TranscriptEvent) -> Result<()> {
        let mut sessions = self.sessions.lock().unwrap();
        let state = sessions
            .get_mut(session_id)
            .with_context(|| format!("未知のセッション: {}", session_id))?;

        if state.session.ended_at.is_some() {
            anyhow::bail!("finalize済みセッションへの追記: {}", session_id);
        }

        if event.sequence <= state.last_sequence {
            log::warn!(
                "順序逆転した文字起こしを破棄: seq={} (最終書き込み seq={})",
                event.sequence,
                state.last_sequence
            );
            return Ok(());
        }

        let row = TranscriptRow {
            session_id: session_id.to_string(),
            sequence: event.sequence,
            transcription: event.text.clone(),
            created_at: event.emitted_at,
        };
        let line = serde_json::to_string(&row).context("文字起こし行のシリアライズに失敗")?;

        writeln!(state.writer, "{}", line).context("文字起こしログへの書き込みに失敗")?;
        state.writer.flush().context("文字起こしログのフラッシュに失敗")?;

        state.last_sequence = event.sequence;
        state.rows_written += 1;

        Ok(())
    }

    /// セッションを確定
    ///
    /// `ended_at = now`、参加者数と録音時間（分、切り捨て）を一度だけ
    /// 書き込み、メタデータファイルを出力する。2回目以降の呼び出しは
    /// 何もせず `AlreadyFinalized` を報告する。
    pub fn finalize(&self, session_id: &str, participant_count: usize) -> Result<FinalizeOutcome> {
        let mut sessions = self.sessions.lock().unwrap();
        let state = sessions
            .get_mut(session_id)
            .with_context(|| format!("未知のセッション: {}", session_id))?;

        if state.session.ended_at.is_some() {
            log::warn!("セッション {} はすでにfinalize済みです", session_id);
            return Ok(FinalizeOutcome::AlreadyFinalized);
        }

        let ended_at = Utc::now();
        state.session.ended_at = Some(ended_at);
        state.session.participant_count = Some(participant_count);
        state.session.duration_minutes =
            Some(duration_minutes(state.session.started_at, ended_at));

        state.writer.flush().context("文字起こしログのフラッシュに失敗")?;

        let row = SessionRow {
            id: state.session.id.clone(),
            classroom_id: state.session.classroom_id.clone(),
            started_at: state.session.started_at,
            ended_at: state.session.ended_at,
            student_count: state.session.participant_count,
            duration_minutes: state.session.duration_minutes,
        };
        let meta_path = self.session_meta_path(session_id);
        let content =
            serde_json::to_string_pretty(&row).context("セッション行のシリアライズに失敗")?;
        fs::write(&meta_path, content)
            .with_context(|| format!("セッションメタデータの書き込みに失敗: {:?}", meta_path))?;

        log::info!(
            "セッション {} をfinalize: {} 行, {} 分, 参加者 {} 名",
            session_id,
            state.rows_written,
            state.session.duration_minutes.unwrap_or(0),
            participant_count
        );

        Ok(FinalizeOutcome::Finalized(state.session.clone()))
    }

    /// セッション情報を取得
    pub fn session(&self, session_id: &str) -> Option<Session> {
        self.sessions
            .lock()
            .unwrap()
            .get(session_id)
            .map(|s| s.session.clone())
    }

    /// 文字起こしログファイルのパス
    pub fn transcript_log_path(&self, session_id: &str) -> PathBuf {
        self.output_dir.join(format!("{}.jsonl", session_id))
    }

    /// セッションメタデータファイルのパス
    pub fn session_meta_path(&self, session_id: &str) -> PathBuf {
        self.output_dir.join(format!("{}.meta.json", session_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn event(session_id: &str, sequence: u64, text: &str) -> TranscriptEvent {
        TranscriptEvent {
            session_id: session_id.to_string(),
            sequence,
            text: text.to_string(),
            emitted_at: Utc::now(),
        }
    }

    #[test]
    fn test_duration_minutes_floor() {
        let start = Utc.timestamp_millis_opt(0).unwrap();
        let end = Utc.timestamp_millis_opt(125_000).unwrap();
        // floor(125000 / 60000) = 2
        assert_eq!(duration_minutes(start, end), 2);

        let end = Utc.timestamp_millis_opt(59_999).unwrap();
        assert_eq!(duration_minutes(start, end), 0);

        let end = Utc.timestamp_millis_opt(60_000).unwrap();
        assert_eq!(duration_minutes(start, end), 1);
    }

    #[test]
    fn test_start_append_finalize() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let recorder = SessionRecorder::new(temp_dir.path())?;

        let session = recorder.start("classroom-1")?;
        assert!(session.ended_at.is_none());

        recorder.append(&session.id, &event(&session.id, 1, "こんにちは"))?;
        recorder.append(&session.id, &event(&session.id, 2, "今日の授業を始めます"))?;

        let outcome = recorder.finalize(&session.id, 3)?;
        let finalized = match outcome {
            FinalizeOutcome::Finalized(s) => s,
            other => panic!("Finalized を期待: {:?}", other),
        };
        assert!(finalized.ended_at.is_some());
        assert_eq!(finalized.participant_count, Some(3));

        // ログはシーケンス昇順で並んでいる
        let content = fs::read_to_string(recorder.transcript_log_path(&session.id))?;
        let rows: Vec<TranscriptRow> = content
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].sequence, 1);
        assert_eq!(rows[0].transcription, "こんにちは");
        assert_eq!(rows[1].sequence, 2);

        // メタデータファイルの内容を確認
        let meta = fs::read_to_string(recorder.session_meta_path(&session.id))?;
        let row: SessionRow = serde_json::from_str(&meta)?;
        assert_eq!(row.student_count, Some(3));
        assert_eq!(row.classroom_id, "classroom-1");

        Ok(())
    }

    #[test]
    fn test_double_finalize_is_noop() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let recorder = SessionRecorder::new(temp_dir.path())?;

        let session = recorder.start("classroom-1")?;
        assert!(matches!(
            recorder.finalize(&session.id, 5)?,
            FinalizeOutcome::Finalized(_)
        ));

        // 2回目は何も変更せず AlreadyFinalized を報告
        assert!(matches!(
            recorder.finalize(&session.id, 99)?,
            FinalizeOutcome::AlreadyFinalized
        ));
        assert_eq!(
            recorder.session(&session.id).unwrap().participant_count,
            Some(5)
        );

        Ok(())
    }

    #[test]
    fn test_out_of_order_append_is_dropped() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let recorder = SessionRecorder::new(temp_dir.path())?;

        let session = recorder.start("classroom-1")?;
        recorder.append(&session.id, &event(&session.id, 5, "five"))?;
        // 順序逆転はエラーにはならないが書き込まれない
        recorder.append(&session.id, &event(&session.id, 3, "three"))?;
        // 欠番は許容される
        recorder.append(&session.id, &event(&session.id, 9, "nine"))?;

        let content = fs::read_to_string(recorder.transcript_log_path(&session.id))?;
        let sequences: Vec<u64> = content
            .lines()
            .map(|line| serde_json::from_str::<TranscriptRow>(line).unwrap().sequence)
            .collect();
        assert_eq!(sequences, vec![5, 9]);

        Ok(())
    }

    #[test]
    fn test_append_unknown_session_fails() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let recorder = SessionRecorder::new(temp_dir.path())?;

        let result = recorder.append("nonexistent", &event("nonexistent", 1, "x"));
        assert!(result.is_err());

        Ok(())
    }

    #[test]
    fn test_append_after_finalize_fails() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let recorder = SessionRecorder::new(temp_dir.path())?;

        let session = recorder.start("classroom-1")?;
        recorder.finalize(&session.id, 0)?;

        let result = recorder.append(&session.id, &event(&session.id, 1, "late"));
        assert!(result.is_err());

        Ok(())
    }
}
