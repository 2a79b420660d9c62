use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 16ビット整数型のオーディオサンプル
///
/// PCM形式の音声データを表現するための型エイリアス。
/// -32768 から 32767 の範囲の値を取る。
pub type SampleI16 = i16;

/// オーディオフレーム
///
/// マイク入力から取得したモノラルPCM16音声データのまとまり。
/// 送信後は保持されない（揮発性データ）。順序は到着順で暗黙に決まる。
///
/// # Examples
///
/// ```
/// # use lecture_relay::types::AudioFrame;
/// let frame = AudioFrame {
///     samples: vec![0i16; 2048], // 128ms分 @ 16kHz
///     timestamp_ns: 1_000_000_000,
/// };
/// ```
#[derive(Clone, Debug)]
pub struct AudioFrame {
    /// PCM音声サンプルの配列（モノラル、16kHz）
    pub samples: Vec<SampleI16>,

    /// このフレームの開始タイムスタンプ (ナノ秒)
    ///
    /// UNIX_EPOCHからの経過時間
    pub timestamp_ns: u128,
}

/// 文字起こしイベント
///
/// STTコネクタが発行する確定テキスト1件。`sequence` はセッション内で
/// 単調増加し、同一セッション内で重複しない。SessionRecorder と
/// TranscriptBroadcaster の両方がこれを消費する。
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TranscriptEvent {
    /// 所属する録音セッションのID
    pub session_id: String,

    /// セッション内のシーケンス番号（1始まり、単調増加）
    pub sequence: u64,

    /// 文字起こしテキスト
    pub text: String,

    /// コネクタがこのイベントを発行した時刻
    pub emitted_at: DateTime<Utc>,
}

/// 参加者のロール
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// 教師（音声の発信者）
    Teacher,
    /// 生徒（翻訳の受信者）
    Student,
}

/// リスナー（在席中の参加者）
///
/// プレゼンス参加時に生成され、退出・切断時に破棄される。
/// PresenceTracker が所有し、TranscriptBroadcaster が読み取り、
/// ListenerPipeline のキーとして使われる。
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Listener {
    /// リスナーID（接続単位で一意）
    pub listener_id: String,

    /// 翻訳先の言語コード
    pub target_language: String,

    /// 音声合成（TTS）を有効にするか
    pub audio_enabled: bool,

    /// ロール
    pub role: Role,
}

/// 録音セッション
///
/// 教師が録音を開始した時点で生成され、停止時に一度だけ finalize される。
/// finalize 後は不変。SessionRecorder が唯一の書き込み者。
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    /// セッションID
    pub id: String,

    /// 教室ID
    pub classroom_id: String,

    /// 開始時刻
    pub started_at: DateTime<Utc>,

    /// 終了時刻（finalize されるまで None）
    pub ended_at: Option<DateTime<Utc>>,

    /// 参加者数（finalize 時に一度だけ書き込まれる）
    pub participant_count: Option<usize>,

    /// 録音時間（分、切り捨て。finalize 時に一度だけ書き込まれる）
    pub duration_minutes: Option<i64>,
}

/// 翻訳ジョブの状態
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// デバウンス待ち
    Pending,
    /// 翻訳・合成を実行中
    Running,
    /// 新しいジョブに追い越された（結果は破棄）
    Superseded,
    /// 完了
    Done,
    /// 翻訳失敗
    Failed,
}

/// 翻訳ジョブ
///
/// デバウンス期間が経過するたびに ListenerPipeline が生成する。
/// リスナーごとに pending / running のジョブは同時に1つまでで、
/// 新しいジョブは未コミットの古いジョブを直ちに追い越す（supersede）。
/// `generation` はリスナーごとの単調増加カウンタで、
/// 古い結果の検出・破棄に使う。
#[derive(Clone, Debug)]
pub struct TranslationJob {
    /// 対象リスナーのID
    pub listener_id: String,

    /// 翻訳元テキスト（デバウンス後に確定した発話）
    pub source_text: String,

    /// 翻訳元の文字起こしシーケンス番号
    pub source_sequence: u64,

    /// スケジュール時点で捕捉した世代番号
    pub generation: u64,

    /// ジョブの状態
    pub status: JobStatus,
}

/// バッファオーバーフロー時のドロップポリシー
///
/// フレームキューの容量を超えた場合にどのデータを破棄するかを指定する。
///
/// # Examples
///
/// ```
/// # use lecture_relay::types::DropPolicy;
/// let policy = DropPolicy::DropOldest; // 最古のデータから破棄
/// ```
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    /// 最古のデータから破棄
    ///
    /// リアルタイム処理では通常これを使用する
    DropOldest,

    /// 最新のデータを破棄
    ///
    /// 過去のデータを優先する場合に使用
    DropNewest,
}
