// Harness compartido de los tests de pipeline: DB en memoria, project demo
// y un generator guionado por respuestas.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::Mutex;

use fabrica::db::Database;
use fabrica::error::WriterError;
use fabrica::factory::Factory;
use fabrica::llm::{GenerateRequest, Generation, Generator, MemoryIndex, demo_prose, estimate_tokens};

pub struct Harness {
    pub db: Database,
    pub factory: Factory,
    pub project_id: String,
}

pub async fn harness_with(generator: Arc<dyn Generator>) -> Harness {
    let db = Database::connect_in_memory().await.unwrap();
    let project_id = db.inject_demo_project().await.unwrap();
    let factory = Factory::new(db.clone(), generator, MemoryIndex::new())
        .await
        .unwrap();
    Harness {
        db,
        factory,
        project_id,
    }
}

/// Qué debe devolver el generator en una llamada.
#[derive(Debug, Clone)]
pub enum Response {
    /// Prosa sana del tamaño pedido en el prompt.
    Good,
    /// Prosa sana + un párrafo extra (p.ej. para forzar un beat dominante).
    GoodPlus(&'static str),
    /// Prosa monótona que reprueba el quality gate.
    Weak,
    /// Prosa con hook/cliffhanger/diálogo pero escritura repetitiva: cae en
    /// la banda de auto_rewrite del quality gate.
    Medium,
    /// Error del writer.
    Fail(FailKind),
}

#[derive(Debug, Clone, Copy)]
pub enum FailKind {
    Empty,
    Upstream,
    Timeout,
}

/// Generator guionado: consume las respuestas en orden; la última se repite.
/// Cuenta llamadas para verificar la cota 1 + maxRewriteAttempts.
pub struct ScriptedGenerator {
    script: Mutex<Vec<Response>>,
    pub calls: AtomicU32,
    /// (input_tokens, output_tokens) reportados por cada generación.
    pub tokens: (i64, i64),
}

impl ScriptedGenerator {
    pub fn new(script: Vec<Response>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            calls: AtomicU32::new(0),
            tokens: (0, 0),
        })
    }

    pub fn with_tokens(script: Vec<Response>, tokens: (i64, i64)) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            calls: AtomicU32::new(0),
            tokens,
        })
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

fn weak_prose(target: usize) -> String {
    let mut out = String::new();
    while out.split_whitespace().count() < target {
        out.push_str("Ngày hôm đó trời đẹp và mọi chuyện diễn ra bình thường như mọi khi. ");
    }
    out
}

fn medium_prose(target: usize) -> String {
    let mut out =
        String::from("Máu loang trên nền đá, sát khí tràn ra khắp đại điện cổ. ");
    let mut i = 0usize;
    while out.split_whitespace().count() + 45 < target {
        out.push_str(
            "Lâm Phong và Tô Nhi tiếp tục đi về phía trước trên con đường cũ quen thuộc. ",
        );
        if i % 6 == 5 {
            out.push_str("“Cẩn thận!” Tô Nhi nói, ánh mắt kinh ngạc nhìn quanh. ");
        }
        i += 1;
    }
    out.push_str(
        "Đúng lúc này một bóng đen chắn ngang lối đi, Lâm Phong chưa kịp phản ứng thì đột nhiên…",
    );
    out
}

#[async_trait::async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(&self, req: GenerateRequest) -> Result<Generation, WriterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let number = req
            .user
            .lines()
            .find_map(|l| l.strip_prefix("SỐ CHƯƠNG: "))
            .and_then(|s| s.trim().parse::<i64>().ok())
            .unwrap_or(1);
        let target = req
            .user
            .lines()
            .find_map(|l| l.strip_prefix("ĐỘ DÀI MỤC TIÊU: "))
            .and_then(|s| s.split_whitespace().next())
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(900);

        let response = {
            let mut script = self.script.lock().await;
            if script.len() > 1 {
                script.remove(0)
            } else {
                script.first().cloned().unwrap_or(Response::Good)
            }
        };

        let body = match response {
            Response::Good => demo_prose(number, target),
            Response::GoodPlus(extra) => {
                format!("{}\n{}", extra, demo_prose(number, target))
            }
            Response::Weak => weak_prose(target),
            Response::Medium => medium_prose(target),
            Response::Fail(kind) => {
                return Err(match kind {
                    FailKind::Empty => WriterError::Empty,
                    FailKind::Upstream => WriterError::Upstream("503 from gateway".into()),
                    FailKind::Timeout => {
                        WriterError::Timeout(std::time::Duration::from_secs(300))
                    }
                });
            }
        };

        let text = format!("Chương {number}: Bước chân không lùi\n\n{body}");
        let (input_tokens, output_tokens) = if self.tokens == (0, 0) {
            (
                estimate_tokens(req.user.chars().count()),
                estimate_tokens(text.chars().count()),
            )
        } else {
            self.tokens
        };

        Ok(Generation {
            text,
            input_tokens,
            output_tokens,
        })
    }
}

/// Generator lento: prosa buena con latencia fija. Para tests de pause/stop
/// y de carreras entre ticks.
pub struct SlowGenerator {
    pub latency: std::time::Duration,
}

#[async_trait::async_trait]
impl Generator for SlowGenerator {
    async fn generate(&self, req: GenerateRequest) -> Result<Generation, WriterError> {
        tokio::time::sleep(self.latency).await;

        let number = req
            .user
            .lines()
            .find_map(|l| l.strip_prefix("SỐ CHƯƠNG: "))
            .and_then(|s| s.trim().parse::<i64>().ok())
            .unwrap_or(1);
        let target = req
            .user
            .lines()
            .find_map(|l| l.strip_prefix("ĐỘ DÀI MỤC TIÊU: "))
            .and_then(|s| s.split_whitespace().next())
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(900);

        let text = format!(
            "Chương {number}: Bước chân không lùi\n\n{}",
            demo_prose(number, target)
        );
        let output_tokens = estimate_tokens(text.chars().count());
        Ok(Generation {
            input_tokens: estimate_tokens(req.user.chars().count()),
            output_tokens,
            text,
        })
    }
}
