// ========================================
// demo.rs - Inyección de datos demo
// ========================================
// Siembra un project completo (novel + project + outline + canon inicial)
// para que el binario pueda ejercitar el pipeline sin control plane.

use tracing::info;

use crate::db::Database;
use crate::model::{
    ArcOutline, CanonFact, ChapterOutline, Genre, Outline, Project, ProjectStatus,
};

pub const DEMO_PROJECT_ID: &str = "proj-demo-kiemtrung";
pub const DEMO_NOVEL_ID: &str = "novel-demo-kiemtrung";

impl Database {
    /// Crea (o deja intacto) el project demo. Devuelve su id.
    pub async fn inject_demo_project(&self) -> Result<String, sqlx::Error> {
        if self.get_project(DEMO_PROJECT_ID).await?.is_some() {
            info!("ℹ️ Demo project already present");
            return Ok(DEMO_PROJECT_ID.to_string());
        }

        self.create_novel(DEMO_NOVEL_ID, "Vạn Kiếm Trủng").await?;

        self.create_project(&Project {
            id: DEMO_PROJECT_ID.to_string(),
            novel_id: DEMO_NOVEL_ID.to_string(),
            genre: Genre::Cultivation,
            main_character: "Lâm Phong".to_string(),
            current_chapter: 0,
            total_planned_chapters: 12,
            target_chapter_length: 900,
            model_preference: "demo".to_string(),
            status: ProjectStatus::Active,
            updated_at: crate::db::helpers::now_epoch(),
        })
        .await?;

        let chapter_outlines: Vec<ChapterOutline> = (1..=12)
            .map(|n| ChapterOutline {
                chapter_number: n,
                title: format!("Bước thứ {n} trên kiếm đạo"),
                summary: format!(
                    "Lâm Phong tiến thêm một bước trên con đường kiếm đạo, chương {n}."
                ),
                key_points: vec![
                    "xung đột leo thang".to_string(),
                    "một thu hoạch mới".to_string(),
                ],
                tension_target: 50 + (n % 4) * 10,
                dopamine_type: if n % 3 == 0 { "breakthrough" } else { "face-slap" }.to_string(),
                characters: vec!["Lâm Phong".to_string(), "Tô Nhi".to_string()],
            })
            .collect();

        self.replace_outline(&Outline {
            project_id: DEMO_PROJECT_ID.to_string(),
            tagline: "Một thanh kiếm gãy, một con đường nghịch thiên.".to_string(),
            world_description: "Đại lục Huyền Thiên, nơi kiếm tu thống trị vạn đạo."
                .to_string(),
            power_system: "Luyện Khí → Trúc Cơ → Kim Đan → Nguyên Anh".to_string(),
            main_character_name: "Lâm Phong".to_string(),
            main_character_motivation: "Rửa nỗi oan cho sư môn đã bị diệt.".to_string(),
            arc_outlines: vec![
                ArcOutline {
                    arc_number: 1,
                    title: "Phế vật nghịch tập".to_string(),
                    start_chapter: 1,
                    end_chapter: 6,
                    theme: "awakening".to_string(),
                    key_events: vec!["thức tỉnh kiếm hồn".to_string()],
                    climax: "đại hội tông môn".to_string(),
                },
                ArcOutline {
                    arc_number: 2,
                    title: "Vạn Kiếm Trủng".to_string(),
                    start_chapter: 7,
                    end_chapter: 12,
                    theme: "revenge".to_string(),
                    key_events: vec!["bí mật của trủng chủ".to_string()],
                    climax: "quyết chiến dưới mộ kiếm".to_string(),
                },
            ],
            chapter_outlines,
        })
        .await?;

        // Canon inicial: el MC existe y está vivo; el mundo tiene un lugar.
        for fact in [
            CanonFact::new(DEMO_PROJECT_ID, "Lâm Phong", "alive", "true", 0),
            CanonFact::new(DEMO_PROJECT_ID, "Lâm Phong", "realm", "Luyện Khí", 0),
            CanonFact::new(DEMO_PROJECT_ID, "Tô Nhi", "alive", "true", 0),
            CanonFact::new(DEMO_PROJECT_ID, "Vạn Kiếm Trủng", "is-location", "true", 0),
        ] {
            self.upsert_canon_fact(&fact).await?;
        }

        info!("🌱 Demo project seeded: {}", DEMO_PROJECT_ID);
        Ok(DEMO_PROJECT_ID.to_string())
    }
}
