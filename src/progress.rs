use std::io::{self, Write};

/// In-place progress display for per-K work
pub struct SimpleProgress {
    total: usize,
    current: usize,
}

impl SimpleProgress {
    pub fn new(total: usize) -> Self {
        Self { total, current: 0 }
    }

    /// Update progress (refreshes on each call; per-K counts are small)
    pub fn update(&mut self, current: usize) -> io::Result<()> {
        self.current = current;
        let percentage = if self.total > 0 {
            (current * 100) / self.total
        } else {
            0
        };
        print!(
            "\r[Progressing] {}/{} ({}%)",
            self.current, self.total, percentage
        );
        io::stdout().flush()?;
        Ok(())
    }

    /// Finish progress display
    pub fn finish(&mut self) -> io::Result<()> {
        self.current = self.total;
        println!("\r[Progressing] {}/{} (100%)", self.total, self.total);
        io::stdout().flush()?;
        Ok(())
    }
}

/// Format time as "xx h xx m xx.xxx s" format
pub fn format_time_used(elapsed: std::time::Duration) -> String {
    let total_secs = elapsed.as_secs_f64();
    let hours = (total_secs / 3600.0) as u64;
    let minutes = ((total_secs % 3600.0) / 60.0) as u64;
    let seconds = total_secs % 60.0;

    if hours > 0 {
        format!(
            "[Time used] {:02} h {:02} m {:05.3} s",
            hours, minutes, seconds
        )
    } else if minutes > 0 {
        format!("[Time used] {:02} m {:05.3} s", minutes, seconds)
    } else {
        format!("[Time used] {:05.3} s", seconds)
    }
}
