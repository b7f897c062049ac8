use crate::error::Result;
use chrono::{DateTime, Utc};
use rust_xlsxwriter::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One learner/course line of the progress report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressExportRow {
    pub user_id: Uuid,
    pub learner_name: String,
    pub email: String,
    pub course_name: String,
    pub percent_complete: u8,
    pub completed_blocks: u32,
    pub total_blocks: u32,
    pub completed_assessments: u32,
    pub total_assessments: u32,
    pub xp: i64,
    pub enrolled_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

pub struct ExportService;

impl ExportService {
    /// Styled XLSX workbook with one row per enrollment.
    pub fn generate_progress_xlsx(rows: &[ProgressExportRow]) -> Result<Vec<u8>> {
        let mut workbook = Workbook::new();
        let worksheet = workbook.add_worksheet();
        worksheet.set_name("Progress")?;

        let primary_color = Color::RGB(0x1E293B);
        let header_bg = Color::RGB(0x0F172A);
        let header_text = Color::White;
        let alt_row_1 = Color::RGB(0xF8FAFC);
        let alt_row_2 = Color::White;
        let border_color = Color::RGB(0xE2E8F0);

        let done_color = Color::RGB(0x10B981);
        let mid_color = Color::RGB(0xF59E0B);
        let low_color = Color::RGB(0xEF4444);

        let columns = [
            ("#", 6.0),
            ("Learner", 28.0),
            ("Email", 30.0),
            ("Course", 32.0),
            ("Progress (%)", 14.0),
            ("Blocks", 12.0),
            ("Assessments", 14.0),
            ("XP", 10.0),
            ("Enrolled", 18.0),
            ("Completed", 18.0),
        ];
        let last_col = (columns.len() - 1) as u16;

        for (i, (_, width)) in columns.iter().enumerate() {
            worksheet.set_column_width(i as u16, *width)?;
        }

        let title_format = Format::new()
            .set_font_size(16)
            .set_bold()
            .set_font_color(header_text)
            .set_background_color(primary_color)
            .set_align(FormatAlign::CenterAcross)
            .set_align(FormatAlign::VerticalCenter);
        worksheet.set_row_height(0, 36)?;
        worksheet.merge_range(0, 0, 0, last_col, "Learner progress report", &title_format)?;

        let subtitle_format = Format::new()
            .set_font_size(10)
            .set_italic()
            .set_font_color(Color::RGB(0x94A3B8))
            .set_background_color(primary_color)
            .set_align(FormatAlign::CenterAcross)
            .set_align(FormatAlign::VerticalCenter);
        worksheet.set_row_height(1, 22)?;
        let now = Utc::now().format("%d.%m.%Y %H:%M UTC").to_string();
        let subtitle = format!("Exported {}  •  {} enrollments", now, rows.len());
        worksheet.merge_range(1, 0, 1, last_col, &subtitle, &subtitle_format)?;

        let header_format = Format::new()
            .set_bold()
            .set_font_size(10)
            .set_font_color(header_text)
            .set_background_color(header_bg)
            .set_align(FormatAlign::Center)
            .set_align(FormatAlign::VerticalCenter)
            .set_text_wrap()
            .set_border(FormatBorder::Thin)
            .set_border_color(border_color);
        let header_row = 2;
        worksheet.set_row_height(header_row, 28)?;
        for (i, (name, _)) in columns.iter().enumerate() {
            worksheet.write_string_with_format(header_row, i as u16, *name, &header_format)?;
        }

        let data_start_row = 3;
        for (idx, r) in rows.iter().enumerate() {
            let row = data_start_row + idx as u32;
            let bg = if idx % 2 == 0 { alt_row_1 } else { alt_row_2 };

            let base_fmt = Format::new()
                .set_font_size(10)
                .set_background_color(bg)
                .set_align(FormatAlign::VerticalCenter)
                .set_border(FormatBorder::Thin)
                .set_border_color(border_color);
            let center_fmt = base_fmt.clone().set_align(FormatAlign::Center);

            worksheet.set_row_height(row, 20)?;
            worksheet.write_number_with_format(row, 0, (idx + 1) as f64, &center_fmt)?;
            worksheet.write_string_with_format(row, 1, &r.learner_name, &base_fmt.clone().set_bold())?;
            worksheet.write_string_with_format(row, 2, &r.email, &base_fmt)?;
            worksheet.write_string_with_format(row, 3, &r.course_name, &base_fmt)?;

            let pct_color = if r.percent_complete >= 100 {
                done_color
            } else if r.percent_complete >= 50 {
                mid_color
            } else {
                low_color
            };
            let pct_fmt = center_fmt.clone().set_bold().set_font_color(pct_color);
            worksheet.write_number_with_format(row, 4, f64::from(r.percent_complete), &pct_fmt)?;

            let blocks = format!("{}/{}", r.completed_blocks, r.total_blocks);
            worksheet.write_string_with_format(row, 5, &blocks, &center_fmt)?;
            let assessments = format!("{}/{}", r.completed_assessments, r.total_assessments);
            worksheet.write_string_with_format(row, 6, &assessments, &center_fmt)?;
            worksheet.write_number_with_format(row, 7, r.xp as f64, &center_fmt)?;

            let enrolled = r.enrolled_at.format("%d.%m.%Y").to_string();
            worksheet.write_string_with_format(row, 8, &enrolled, &center_fmt)?;
            let completed = r
                .completed_at
                .map(|d| d.format("%d.%m.%Y").to_string())
                .unwrap_or_else(|| "-".to_string());
            worksheet.write_string_with_format(row, 9, &completed, &center_fmt)?;
        }

        let total_row = data_start_row + rows.len() as u32 + 1;
        let summary_fmt = Format::new()
            .set_bold()
            .set_font_size(10)
            .set_font_color(primary_color)
            .set_background_color(Color::RGB(0xE0E7FF))
            .set_align(FormatAlign::Center)
            .set_align(FormatAlign::VerticalCenter)
            .set_border(FormatBorder::Thin)
            .set_border_color(border_color);
        worksheet.set_row_height(total_row, 24)?;

        let completed_count = rows.iter().filter(|r| r.completed_at.is_some()).count();
        let avg = if rows.is_empty() {
            0.0
        } else {
            rows.iter().map(|r| f64::from(r.percent_complete)).sum::<f64>() / rows.len() as f64
        };
        let summary = format!(
            "Total: {} | Completed: {} | Average progress: {:.0}%",
            rows.len(),
            completed_count,
            avg
        );
        worksheet.merge_range(total_row, 0, total_row, last_col, &summary, &summary_fmt)?;

        worksheet.set_freeze_panes(3, 0)?;
        worksheet.autofilter(
            2,
            0,
            (data_start_row + rows.len() as u32).saturating_sub(1).max(2),
            last_col,
        )?;

        let buffer = workbook.save_to_buffer()?;
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workbook_is_a_zip_container() {
        let rows = vec![ProgressExportRow {
            user_id: Uuid::new_v4(),
            learner_name: "Grace".into(),
            email: "grace@example.com".into(),
            course_name: "Compilers".into(),
            percent_complete: 75,
            completed_blocks: 3,
            total_blocks: 4,
            completed_assessments: 0,
            total_assessments: 0,
            xp: 30,
            enrolled_at: Utc::now(),
            completed_at: None,
        }];
        let bytes = ExportService::generate_progress_xlsx(&rows).unwrap();
        assert!(bytes.starts_with(b"PK"));
    }

    #[test]
    fn empty_report_still_renders() {
        let bytes = ExportService::generate_progress_xlsx(&[]).unwrap();
        assert!(!bytes.is_empty());
    }
}
