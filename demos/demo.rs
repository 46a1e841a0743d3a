//! Seeds a few students and prints the analytical views.
//!
//! Run with `cargo run --example demo [config.toml]`.

use chrono::NaiveDate;
use student_records::{Mark, MemoryStore, Result, Student, StudentsConfig, StudentsService};

fn main() -> Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => StudentsConfig::load(path)?,
        None => StudentsConfig::from_env()?,
    };
    let svc = StudentsService::new(MemoryStore::new(), config);

    let day = |m, d| NaiveDate::from_ymd_opt(2024, m, d).unwrap_or_default();
    let roster = [
        (1, "Avi", "050-1111111", vec![("math", 90, day(1, 10)), ("art", 95, day(2, 3))]),
        (2, "Bella", "052-2222222", vec![("math", 70, day(1, 12))]),
        (3, "Carmel", "050-3333333", vec![("math", 85, day(3, 1)), ("bio", 60, day(3, 9))]),
        (4, "Dan", "054-4444444", vec![]),
    ];
    for (id, name, phone, marks) in roster {
        svc.add_student(Student::new(id, name, phone))?;
        for (subject, score, date) in marks {
            svc.add_mark(id, Mark::new(subject, score, date))?;
        }
    }

    println!("average score: {:?}", svc.get_students_avg_score()?);
    println!("good students: {:?}", svc.get_good_students()?);
    println!("phones 050: {:?}", svc.get_students_phone_prefix("050")?);
    for s in svc.get_best_students(2)? {
        println!("best: {} {} ({} marks)", s.id, s.name, s.marks.len());
    }
    for s in svc.get_worst_students(2)? {
        println!("worst: {} {}", s.id, s.name);
    }
    for b in svc.scores_distribution(3)? {
        println!("bucket [{}, {}]: {}", b.min, b.max, b.count);
    }
    println!("removed: {:?}", svc.remove_students_with_few_marks(1)?);
    Ok(())
}
